//! Stream labels: index-addressed annotations carried alongside samples.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// An annotation attached to a position in a stream.
///
/// `index` is a sample offset relative to the start of the window the label
/// is delivered in, and `width` is the number of samples the label covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    /// Identifier of the annotation.
    pub id: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Sample offset.
    pub index: u64,
    /// Number of samples covered, at least one.
    #[serde(default = "default_width")]
    pub width: u64,
}

fn default_width() -> u64 {
    1
}

impl Label {
    /// Create a label with a width of one.
    pub fn new(id: impl Into<String>, data: impl Into<serde_json::Value>, index: u64) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
            index,
            width: 1,
        }
    }

    /// Builder-style width setter.
    pub fn with_width(mut self, width: u64) -> Self {
        self.width = width;
        self
    }

    /// Copy of the label with index and width scaled by `mult / div`.
    ///
    /// Converts between element and byte offsets, or between symbol sizes.
    pub fn to_adjusted(&self, mult: u64, div: u64) -> Self {
        let mut out = self.clone();
        out.adjust(mult, div);
        out
    }

    /// In-place form of [`Label::to_adjusted`].
    pub fn adjust(&mut self, mult: u64, div: u64) {
        self.index = self.index * mult / div;
        self.width = self.width * mult / div;
    }

    /// Compare two labels by position only.
    pub fn cmp_index(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

/// Stable sort by index; labels posted at the same index keep their order.
pub fn sort_labels(labels: &mut [Label]) {
    labels.sort_by(Label::cmp_index);
}

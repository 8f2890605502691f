//! Type descriptors for sample streams.
//!
//! A [`DType`] names the element kind, the byte size of one element and the
//! vector dimension of one logical sample. Descriptors parse from and render
//! to a small markup grammar: `"<alias>[, <dimension>]"`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Numeric family of a descriptor.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// Zero-size, unspecified stream.
    Empty,
    /// Raw bytes without numeric meaning.
    Custom,
    /// Two's complement integer.
    Signed,
    /// Unsigned integer.
    Unsigned,
    /// IEEE-754 float.
    Float,
}

/// Errors from descriptor markup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DTypeError {
    /// The alias or dimension in the markup is not recognized.
    #[error("unknown type markup {0:?}")]
    UnknownType(String),
}

/// Element type descriptor: kind, element size and dimension.
///
/// Two descriptors compare equal when kind, element size and dimension all match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DType {
    kind: ElementKind,
    complex: bool,
    elem_size: usize,
    dimension: usize,
}

impl DType {
    /// The zero-size unspecified descriptor.
    pub const fn empty() -> Self {
        Self {
            kind: ElementKind::Empty,
            complex: false,
            elem_size: 0,
            dimension: 1,
        }
    }

    /// Raw byte stream with `dimension` bytes per sample.
    pub const fn custom(dimension: usize) -> Self {
        Self {
            kind: ElementKind::Custom,
            complex: false,
            elem_size: 1,
            dimension,
        }
    }

    /// Build a numeric descriptor from a real component kind and byte size.
    pub fn numeric(kind: ElementKind, component_size: usize, complex: bool) -> Self {
        let elem_size = if complex {
            component_size * 2
        } else {
            component_size
        };
        Self {
            kind,
            complex,
            elem_size,
            dimension: 1,
        }
    }

    /// Descriptor of a Rust element type.
    pub fn of<T: Element>() -> Self {
        T::dtype()
    }

    /// Parse descriptor markup.
    pub fn parse(markup: &str) -> Result<Self, DTypeError> {
        let unknown = || DTypeError::UnknownType(markup.to_string());
        let (alias, dimension) = match markup.split_once(',') {
            Some((alias, dim)) => {
                let dim = dim.trim();
                if dim.is_empty() || !dim.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(unknown());
                }
                let dim: usize = dim.parse().map_err(|_| unknown())?;
                if dim == 0 {
                    return Err(unknown());
                }
                (alias.trim(), dim)
            }
            None => (markup.trim(), 1),
        };

        if alias.is_empty() {
            return Ok(Self::empty());
        }
        if alias == "custom" {
            return Ok(Self::custom(dimension));
        }

        let (kind, component, complex) = match alias {
            "complex64" => (ElementKind::Float, 4, true),
            "complex128" => (ElementKind::Float, 8, true),
            _ => match alias.strip_prefix("complex_") {
                Some(inner) => {
                    let (kind, size) = lookup_real(inner).ok_or_else(unknown)?;
                    (kind, size, true)
                }
                None => {
                    let (kind, size) = lookup_real(alias).ok_or_else(unknown)?;
                    (kind, size, false)
                }
            },
        };
        Ok(Self::numeric(kind, component, complex).with_dimension(dimension))
    }

    /// Copy of this descriptor with another dimension.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension.max(1);
        self
    }

    /// Element kind of the (real) component.
    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// True for complex element types.
    pub fn is_complex(&self) -> bool {
        self.complex
    }

    /// True for integer element types.
    pub fn is_integer(&self) -> bool {
        matches!(self.kind, ElementKind::Signed | ElementKind::Unsigned)
    }

    /// True for float element types.
    pub fn is_float(&self) -> bool {
        self.kind == ElementKind::Float
    }

    /// True for the signed integer and float kinds.
    pub fn is_signed(&self) -> bool {
        matches!(self.kind, ElementKind::Signed | ElementKind::Float)
    }

    /// True for numeric descriptors (not empty, not custom).
    pub fn is_numeric(&self) -> bool {
        matches!(
            self.kind,
            ElementKind::Signed | ElementKind::Unsigned | ElementKind::Float
        )
    }

    /// True for the empty descriptor.
    pub fn is_empty(&self) -> bool {
        self.kind == ElementKind::Empty
    }

    /// Size of one element in bytes (both components for complex).
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Size of one real component in bytes.
    pub fn component_size(&self) -> usize {
        if self.complex {
            self.elem_size / 2
        } else {
            self.elem_size
        }
    }

    /// Vector width of one sample.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Bytes per sample: `elem_size * dimension`.
    pub fn size(&self) -> usize {
        self.elem_size * self.dimension
    }

    /// The real counterpart of a complex descriptor.
    pub fn to_real(&self) -> Self {
        if !self.complex {
            return *self;
        }
        Self {
            kind: self.kind,
            complex: false,
            elem_size: self.elem_size / 2,
            dimension: self.dimension,
        }
    }

    /// Canonical alias without the dimension.
    pub fn name(&self) -> String {
        let real = match self.kind {
            ElementKind::Empty => return String::new(),
            ElementKind::Custom => return "custom".to_string(),
            ElementKind::Signed => format!("int{}", self.component_size() * 8),
            ElementKind::Unsigned => format!("uint{}", self.component_size() * 8),
            ElementKind::Float => format!("float{}", self.component_size() * 8),
        };
        if self.complex {
            format!("complex_{}", real)
        } else {
            real
        }
    }

    /// Render the descriptor markup; the dimension is omitted when it is one.
    pub fn to_markup(&self) -> String {
        if self.dimension > 1 {
            format!("{}, {}", self.name(), self.dimension)
        } else {
            self.name()
        }
    }
}

impl Default for DType {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_markup())
    }
}

impl FromStr for DType {
    type Err = DTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DType {
    type Error = DTypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DType> for String {
    fn from(value: DType) -> Self {
        value.to_markup()
    }
}

fn lookup_real(alias: &str) -> Option<(ElementKind, usize)> {
    let alias = alias.strip_suffix("_t").unwrap_or(alias);
    match alias {
        "float" | "float32" => return Some((ElementKind::Float, 4)),
        "double" | "float64" => return Some((ElementKind::Float, 8)),
        "byte" | "octet" => return Some((ElementKind::Signed, 1)),
        _ => {}
    }

    // fixed width spellings: int16, sint16, uint16
    for (prefix, kind) in [
        ("uint", ElementKind::Unsigned),
        ("sint", ElementKind::Signed),
        ("int", ElementKind::Signed),
    ] {
        if let Some(bits) = alias.strip_prefix(prefix) {
            if bits.is_empty() {
                break;
            }
            return match bits {
                "8" => Some((kind, 1)),
                "16" => Some((kind, 2)),
                "32" => Some((kind, 4)),
                "64" => Some((kind, 8)),
                _ => None,
            };
        }
    }

    // C spellings with an optional signedness prefix
    let (kind, base) = if let Some(rest) = alias.strip_prefix("unsigned ") {
        (ElementKind::Unsigned, rest.trim())
    } else if let Some(rest) = alias.strip_prefix("signed ") {
        (ElementKind::Signed, rest.trim())
    } else if let Some(rest) = alias.strip_prefix('u').filter(|r| is_c_name(r)) {
        (ElementKind::Unsigned, rest)
    } else if let Some(rest) = alias.strip_prefix('s').filter(|r| is_c_name(r)) {
        (ElementKind::Signed, rest)
    } else {
        (ElementKind::Signed, alias)
    };
    let size = match base {
        "char" => 1,
        "short" => 2,
        "int" => 4,
        "long" | "long long" => 8,
        _ => return None,
    };
    Some((kind, size))
}

fn is_c_name(name: &str) -> bool {
    matches!(name, "char" | "short" | "int" | "long" | "long long")
}

/// A real scalar that can be stored in a chunk.
pub trait Scalar: bytemuck::Pod + Copy + Send + Sync + 'static {
    /// Numeric family.
    const KIND: ElementKind;
}

macro_rules! impl_scalar {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(impl Scalar for $ty {
            const KIND: ElementKind = ElementKind::$kind;
        })*
    };
}

impl_scalar!(
    i8 => Signed, i16 => Signed, i32 => Signed, i64 => Signed,
    u8 => Unsigned, u16 => Unsigned, u32 => Unsigned, u64 => Unsigned,
    f32 => Float, f64 => Float,
);

/// Maps a Rust element type to its descriptor.
///
/// Complex samples are `[T; 2]` pairs holding the real then imaginary part.
pub trait Element: bytemuck::Pod + Copy + Send + Sync + 'static {
    /// The descriptor for this element type.
    fn dtype() -> DType;
}

impl<T: Scalar> Element for T {
    fn dtype() -> DType {
        DType::numeric(T::KIND, std::mem::size_of::<T>(), false)
    }
}

impl<T: Scalar> Element for [T; 2] {
    fn dtype() -> DType {
        DType::numeric(T::KIND, std::mem::size_of::<T>(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn aliases_resolve_to_the_same_descriptor() {
        let int32 = DType::parse("int32").unwrap();
        for alias in ["int", "int32_t", "sint32", "signed int", "sint"] {
            assert_eq!(DType::parse(alias).unwrap(), int32, "alias {alias}");
        }
        assert_eq!(DType::parse("unsigned short").unwrap(), DType::of::<u16>());
        assert_eq!(DType::parse("uint8_t").unwrap(), DType::of::<u8>());
        assert_eq!(DType::parse("byte").unwrap(), DType::of::<i8>());
        assert_eq!(DType::parse("long long").unwrap(), DType::of::<i64>());
        assert_eq!(DType::parse("double").unwrap(), DType::of::<f64>());
        assert_eq!(DType::parse("complex64").unwrap(), DType::of::<[f32; 2]>());
        assert_eq!(
            DType::parse("complex_int16").unwrap(),
            DType::of::<[i16; 2]>()
        );
    }

    #[test]
    fn markup_carries_dimension() {
        let dt = DType::parse("complex_float32, 4").unwrap();
        assert_eq!(dt.elem_size(), 8);
        assert_eq!(dt.dimension(), 4);
        assert_eq!(dt.size(), 32);
        assert_eq!(dt.to_markup(), "complex_float32, 4");
        assert_ne!(dt, DType::of::<[f32; 2]>());
    }

    #[test]
    fn empty_and_custom() {
        let empty = DType::parse("").unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.size(), 0);
        let custom = DType::parse("custom, 16").unwrap();
        assert_eq!(custom.kind(), ElementKind::Custom);
        assert_eq!(custom.size(), 16);
    }

    #[test]
    fn unknown_markup_is_rejected() {
        for bad in ["int12", "quux", "float, x", "int8, ", "complex_custom", "int8, 0"] {
            assert_eq!(
                DType::parse(bad),
                Err(DTypeError::UnknownType(bad.to_string())),
                "markup {bad:?}"
            );
        }
    }

    #[test]
    fn serde_uses_markup() {
        let dt = DType::parse("uint16, 2").unwrap();
        let json = serde_json::to_string(&dt).unwrap();
        assert_eq!(json, "\"uint16, 2\"");
        let back: DType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dt);
    }

    proptest! {
        #[test]
        fn markup_roundtrip(idx in 0usize..12, dim in 1usize..64) {
            let names = [
                "int8", "int16", "int32", "int64", "uint8", "uint16", "uint32", "uint64",
                "float32", "float64", "complex_int32", "complex_float64",
            ];
            let dt = DType::parse(names[idx]).unwrap().with_dimension(dim);
            prop_assert_eq!(DType::parse(&dt.to_markup()).unwrap(), dt);
        }
    }
}

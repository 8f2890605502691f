//! Crate-wide error type.
//!
//! Each module keeps its own error enum; this one wraps them so callers
//! that touch several layers can use a single `?`.

use crate::block::BlockError;
use crate::buffer::BufferError;
use crate::config::ConfigError;
use crate::convert::ConvertError;
use crate::domain::DomainResolutionError;
use crate::dsl::DslError;
use crate::dtype::DTypeError;
use crate::port::PortError;
use crate::registry::RegistryError;
use crate::symbols::SymbolError;
use crate::topology::TopologyError;
use thiserror::Error;

/// Result alias over [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Any failure the kernel reports.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    DType(#[from] DTypeError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Domain(#[from] DomainResolutionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Dsl(#[from] DslError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Symbol(#[from] SymbolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<crate::config::KernelConfig> {
        let config = crate::config::KernelConfig::from_json(text)?;
        Ok(config)
    }

    #[test]
    fn wraps_module_errors() {
        assert!(matches!(parse("{not json"), Err(Error::Config(_))));
        let err: Error = RegistryError::UnknownPath("/x".into()).into();
        assert_eq!(err.to_string(), "no block registered at \"/x\"");
    }
}

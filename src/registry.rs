//! Block registry: path-addressed block factories.

use crate::block::{Block, BlockError, PortDecl, WorkContext};
use crate::dtype::DType;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Registry path of the bridge block used by domain resolution.
pub const COPIER_PATH: &str = "/blocks/copier";

/// Registry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no block registered at {0:?}")]
    UnknownPath(String),
    #[error("block path {0:?} must start with '/'")]
    InvalidPath(String),
    #[error("{path} takes {expected} arguments, got {got}")]
    Arity {
        path: String,
        expected: &'static str,
        got: usize,
    },
    #[error("constructing {path} failed: {source}")]
    Construct { path: String, source: BlockError },
}

type Built = Result<Box<dyn Block>, BlockError>;

/// Constructor signatures a block can register with.
#[derive(Clone)]
pub enum BlockFactory {
    /// No arguments.
    Nullary(Arc<dyn Fn() -> Built + Send + Sync>),
    /// Exactly one argument.
    Unary(Arc<dyn Fn(&Value) -> Built + Send + Sync>),
    /// Any number of arguments.
    Variadic(Arc<dyn Fn(&[Value]) -> Built + Send + Sync>),
}

impl BlockFactory {
    pub fn nullary<F>(f: F) -> Self
    where
        F: Fn() -> Built + Send + Sync + 'static,
    {
        BlockFactory::Nullary(Arc::new(f))
    }

    pub fn unary<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Built + Send + Sync + 'static,
    {
        BlockFactory::Unary(Arc::new(f))
    }

    pub fn variadic<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Built + Send + Sync + 'static,
    {
        BlockFactory::Variadic(Arc::new(f))
    }

    fn call(&self, path: &str, args: &[Value]) -> Result<Box<dyn Block>, RegistryError> {
        let arity = |expected| RegistryError::Arity {
            path: path.to_string(),
            expected,
            got: args.len(),
        };
        let built = match self {
            BlockFactory::Nullary(f) if args.is_empty() => f(),
            BlockFactory::Nullary(_) => return Err(arity("0")),
            BlockFactory::Unary(f) => match args {
                [arg] => f(arg),
                _ => return Err(arity("1")),
            },
            BlockFactory::Variadic(f) => f(args),
        };
        built.map_err(|source| RegistryError::Construct {
            path: path.to_string(),
            source,
        })
    }
}

impl fmt::Debug for BlockFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlockFactory::Nullary(_) => "Nullary",
            BlockFactory::Unary(_) => "Unary",
            BlockFactory::Variadic(_) => "Variadic",
        })
    }
}

/// Maps block paths to factories. Passed explicitly to whoever needs it.
#[derive(Debug, Clone, Default)]
pub struct BlockRegistry {
    factories: BTreeMap<String, BlockFactory>,
}

impl BlockRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the kernel's own blocks.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.insert(COPIER_PATH, BlockFactory::nullary(|| Ok(Box::new(Copier) as Box<dyn Block>)));
        crate::symbols::register(&mut registry);
        registry
    }

    pub(crate) fn insert(&mut self, path: &'static str, factory: BlockFactory) {
        self.factories.insert(path.to_string(), factory);
    }

    /// Register or replace a factory.
    pub fn register(&mut self, path: &str, factory: BlockFactory) -> Result<(), RegistryError> {
        if !path.starts_with('/') {
            return Err(RegistryError::InvalidPath(path.to_string()));
        }
        if self.factories.insert(path.to_string(), factory).is_some() {
            tracing::debug!(path, "replaced block factory");
        }
        Ok(())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.factories.contains_key(path)
    }

    /// Registered paths in order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the block at `path` without arguments.
    pub fn instantiate(&self, path: &str) -> Result<Box<dyn Block>, RegistryError> {
        self.instantiate_with(path, &[])
    }

    /// Build the block at `path` with arguments.
    pub fn instantiate_with(&self, path: &str, args: &[Value]) -> Result<Box<dyn Block>, RegistryError> {
        let factory = self
            .factories
            .get(path)
            .ok_or_else(|| RegistryError::UnknownPath(path.to_string()))?;
        factory.call(path, args)
    }
}

/// Untyped pass-through: copies input bytes into its own output buffer.
#[derive(Debug, Default)]
pub struct Copier;

impl Block for Copier {
    fn input_ports(&self) -> Vec<PortDecl> {
        vec![PortDecl::stream("0", DType::empty())]
    }

    fn output_ports(&self) -> Vec<PortDecl> {
        vec![PortDecl::stream("0", DType::empty())]
    }

    fn work(&mut self, ctx: &mut WorkContext<'_>) -> Result<(), BlockError> {
        let (input, output) = (&mut ctx.inputs[0], &mut ctx.outputs[0]);
        while let Some(message) = input.pop_message() {
            output.post_message(message);
        }
        let n = input.elements().min(output.elements());
        if n == 0 {
            return Ok(());
        }
        output.as_bytes_mut()[..n].copy_from_slice(&input.buffer().as_bytes()[..n]);
        input.consume(n);
        output.produce(n);
        Ok(())
    }
}

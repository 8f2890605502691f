pub mod accumulator;
pub mod block;
pub mod buffer;
pub mod chunk;
pub mod config;
pub mod convert;
pub mod domain;
pub mod dsl;
pub mod dtype;
pub mod error;
#[doc(hidden)]
pub mod harness;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod label;
pub mod message;
pub mod pool;
pub mod port;
pub mod registry;
pub mod symbols;
pub mod topology;
pub mod worker;

pub use block::{Block, BlockError, PortDecl, PortKind, WorkContext, WorkInfo};
pub use buffer::{BufferError, SharedBuffer};
pub use chunk::TypedChunk;
pub use config::KernelConfig;
pub use domain::{BufferMode, DomainFlowResolver, Flow};
pub use dsl::TopologyBuilder;
pub use dtype::{DType, Element};
pub use error::{Error, Result};
pub use label::Label;
pub use message::{Message, Packet};
pub use pool::{BufferPool, PoolArgs, PooledBuffer};
pub use port::{InputHandle, InputPort, OutputPort};
pub use registry::{BlockFactory, BlockRegistry};
pub use topology::{BlockId, Endpoint, Topology};
pub use worker::Worker;

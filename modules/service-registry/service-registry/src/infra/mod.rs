//! Infrastructure adapters.

pub mod coordination;

pub use coordination::{
    ConnectionState, CoordinationBackend, CoordinationClient, CoordinationError, CreateMode,
    EtcdConfig, EtcdCoordination, MemoryCoordination, MemoryStore,
};

pub mod activation;
pub mod feedback;
pub mod forget;
pub mod graph;
pub mod indexer;
pub mod lexical;
pub mod locks;
pub mod maintenance;
pub mod manager;
pub mod registry;
pub mod rerank;
pub mod search;
pub mod stats;
pub mod store;
pub mod transfer;
pub mod types;

pub use manager::{MemoryHit, MemoryManager, SearchRequest, StoreRequest};
pub use registry::OperationRegistry;

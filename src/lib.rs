pub mod chunker;
pub mod config;
pub mod embedding_client;
pub mod error;
pub mod indexer;
pub mod retriever;
pub mod store;
pub mod vector_index;

//! Stage-1 consumer logic: turns raw `get_blocks_result` frames into index
//! records using contract ABIs, filters and enrichment handlers.
mod abi_cache;
mod block;
mod filters;
pub mod handlers;

pub use abi_cache::{
    AbiCache, AbiCacheEntry, AbiSource, AbiSourceChain, ChainApiAbiSource, SourcedAbi,
    StorageAbiSource,
};
pub use block::{BlockDeserializer, DeserializedBlock, DeserializerSettings, Reinterpreter};
pub use filters::Filters;
pub use handlers::HandlerRegistry;

pub(crate) const DESERIALIZER: &str = "deserializer";

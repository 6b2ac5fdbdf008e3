//! Store collaborators
//!
//! The engine reaches each side through a [`StoreClient`] (fetch, list,
//! write) and a [`Converter`] (native shape to canonical and back).

mod memory;
mod traits;

pub use memory::{JsonConverter, MemoryStore};
pub use traits::{Converter, NativeItem, StoreClient, StoreEndpoint, StorePair};

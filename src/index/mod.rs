//! Input units: identities, discovery and chunking.

mod chunker;
mod discovery;
pub(crate) mod identity;

pub use chunker::{Chunk, Chunker};
pub use discovery::{InputDiscoverer, InputUnit};
pub use identity::Identity;

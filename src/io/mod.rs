//! I/O: VCF framing, the unit cache and the run manifest.

pub mod artifact;
mod cache_store;
pub mod manifest;
mod store;
pub mod vcf;

pub use artifact::{ArtifactSet, Table};
pub use cache_store::{CacheEntry, CacheStore, EntryInfo, ObjectCacheStore, TableDigest};
pub use manifest::{ManifestLine, RunManifest};
pub use store::{create_cache_store, parse_s3_uri};

//! Identity-keyed, write-once storage of unit artifacts.
//!
//! Layout under the store prefix:
//! ```text
//! {namespace}/
//! └── {identity}/
//!     ├── {generation}/
//!     │   ├── {identity}.vcf     # records
//!     │   ├── {identity}.psam    # samples
//!     │   └── {identity}.log     # metadata
//!     └── entry.json             # written last, create-only
//! ```
//!
//! Every `put` uploads its tables under a fresh generation directory, and the
//! create-only `entry.json` names the generation it commits. Two writers racing
//! on one key never touch each other's tables: the loser's `entry.json` is
//! rejected and its generation is removed. A key is a hit exactly when
//! `entry.json` parses and every table it lists exists with the recorded size,
//! so an interrupted `put` never produces a hit.

use crate::config::ArtifactLayout;
use crate::context::Namespace;
use crate::error::CacheError;
use crate::index::Identity;
use crate::io::artifact::{ArtifactSet, Table};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, ObjectStoreExt, PutMode, PutPayload};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const ENTRY_FILE: &str = "entry.json";
pub const ENTRY_FORMAT_VERSION: u32 = 2;

const COPY_BUFFER: usize = 1 << 20;

static PUT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Directory name unique to one `put` call, across processes and hosts.
fn new_generation(run_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(PUT_SEQUENCE.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hasher.update(
        Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_le_bytes(),
    );
    let digest = format!("{:x}", hasher.finalize());
    format!("{}-{}", run_id, &digest[..12])
}

/// Size and digest of one stored table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDigest {
    pub table: Table,
    pub file: String,
    pub size: u64,
    pub sha256: String,
}

/// Contents of `entry.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub format_version: u32,
    pub namespace: Namespace,
    pub identity: Identity,
    pub created_at: DateTime<Utc>,
    pub run_id: String,
    /// Directory under the key holding this entry's tables
    pub generation: String,
    /// False when some chunks of the unit failed (provisional unit)
    pub complete: bool,
    pub chunks_total: usize,
    pub chunks_failed: usize,
    pub record_count: u64,
    pub tables: Vec<TableDigest>,
}

impl CacheEntry {
    pub fn failed_fraction(&self) -> f64 {
        if self.chunks_total == 0 {
            0.0
        } else {
            self.chunks_failed as f64 / self.chunks_total as f64
        }
    }
}

/// Provenance recorded alongside a unit artifact.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub run_id: String,
    pub chunks_total: usize,
    pub chunks_failed: usize,
}

/// Durable unit artifact storage addressed by `(namespace, identity)`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read the entry for a key if it is a complete, well-formed hit.
    async fn entry(
        &self,
        namespace: &Namespace,
        identity: &Identity,
    ) -> Result<Option<CacheEntry>, CacheError>;

    /// Store a unit artifact. Fails with [`CacheError::AlreadyPresent`] if the key is a hit.
    async fn put(
        &self,
        namespace: &Namespace,
        identity: &Identity,
        artifact: &ArtifactSet,
        info: EntryInfo,
    ) -> Result<CacheEntry, CacheError>;

    /// Materialize a stored artifact under `dest_dir`.
    async fn get(
        &self,
        namespace: &Namespace,
        identity: &Identity,
        dest_dir: &Path,
    ) -> Result<ArtifactSet, CacheError>;

    /// Identities with a hit in `namespace`.
    async fn list(&self, namespace: &Namespace) -> Result<Vec<Identity>, CacheError>;

    async fn has(&self, namespace: &Namespace, identity: &Identity) -> Result<bool, CacheError> {
        Ok(self.entry(namespace, identity).await?.is_some())
    }
}

/// [`CacheStore`] on top of any `object_store` backend.
pub struct ObjectCacheStore {
    store: Arc<dyn ObjectStore>,
    prefix: ObjectPath,
    layout: ArtifactLayout,
}

impl ObjectCacheStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: ObjectPath, layout: ArtifactLayout) -> Self {
        Self {
            store,
            prefix,
            layout,
        }
    }

    fn namespace_path(&self, namespace: &Namespace) -> ObjectPath {
        self.prefix.child(namespace.as_str())
    }

    fn key_path(&self, namespace: &Namespace, identity: &Identity) -> ObjectPath {
        self.namespace_path(namespace).child(identity.as_str())
    }

    fn table_file(&self, identity: &Identity, table: Table) -> String {
        format!("{}.{}", identity, self.layout.extension(table))
    }

    fn generation_path(&self, namespace: &Namespace, identity: &Identity, generation: &str) -> ObjectPath {
        self.key_path(namespace, identity).child(generation)
    }

    /// Best-effort removal of a generation that was never committed.
    async fn discard_generation(&self, dir: &ObjectPath, tables: &[TableDigest]) {
        for digest in tables {
            if let Err(e) = self.store.delete(&dir.child(digest.file.as_str())).await {
                tracing::debug!("Could not remove uncommitted table {}/{}: {}", dir, digest.file, e);
            }
        }
    }

    async fn read_entry(
        &self,
        namespace: &Namespace,
        identity: &Identity,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.key_path(namespace, identity).child(ENTRY_FILE);
        let bytes = match self.store.get(&path).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                tracing::warn!("Ignoring unreadable cache entry {}: {}", path, e);
                Ok(None)
            }
        }
    }

    /// Check that an entry describes this key and its tables are all present.
    async fn verify(
        &self,
        namespace: &Namespace,
        identity: &Identity,
        entry: &CacheEntry,
    ) -> Result<bool, CacheError> {
        if entry.format_version != ENTRY_FORMAT_VERSION
            || &entry.namespace != namespace
            || &entry.identity != identity
        {
            tracing::warn!(
                "Cache entry {}/{} does not match its key or format, ignoring",
                namespace,
                identity
            );
            return Ok(false);
        }

        let dir = self.generation_path(namespace, identity, &entry.generation);
        for table in Table::ALL {
            let Some(digest) = entry.tables.iter().find(|d| d.table == table) else {
                return Ok(false);
            };
            match self.store.head(&dir.child(digest.file.as_str())).await {
                Ok(meta) if meta.size == digest.size => {}
                Ok(meta) => {
                    tracing::warn!(
                        "Cache table {}/{}/{} has size {} (expected {}), ignoring entry",
                        namespace,
                        identity,
                        digest.file,
                        meta.size,
                        digest.size
                    );
                    return Ok(false);
                }
                Err(object_store::Error::NotFound { .. }) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Upload one local file, returning its size and sha256.
    async fn upload(&self, source: &Path, dest: ObjectPath) -> Result<(u64, String), CacheError> {
        let mut file = tokio::fs::File::open(source).await?;
        let mut writer = BufWriter::new(self.store.clone(), dest);
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; COPY_BUFFER];

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            writer.write_all(&buf[..n]).await?;
            size += n as u64;
        }
        writer.shutdown().await?;

        Ok((size, format!("{:x}", hasher.finalize())))
    }

    /// Download one object to a local file, returning its sha256.
    async fn download(&self, source: &ObjectPath, dest: &Path) -> Result<String, CacheError> {
        let mut stream = self.store.get(source).await?.into_stream();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(format!("{:x}", hasher.finalize()))
    }
}

#[async_trait]
impl CacheStore for ObjectCacheStore {
    async fn entry(
        &self,
        namespace: &Namespace,
        identity: &Identity,
    ) -> Result<Option<CacheEntry>, CacheError> {
        match self.read_entry(namespace, identity).await? {
            Some(entry) if self.verify(namespace, identity, &entry).await? => Ok(Some(entry)),
            _ => Ok(None),
        }
    }

    async fn put(
        &self,
        namespace: &Namespace,
        identity: &Identity,
        artifact: &ArtifactSet,
        info: EntryInfo,
    ) -> Result<CacheEntry, CacheError> {
        let already_present = || CacheError::AlreadyPresent {
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        };

        let key = self.key_path(namespace, identity);
        let entry_path = key.child(ENTRY_FILE);

        match self.read_entry(namespace, identity).await? {
            Some(entry) if self.verify(namespace, identity, &entry).await? => {
                return Err(already_present());
            }
            Some(_) => {
                // Stale entry from an older layout: clear it before committing ours
                self.store.delete(&entry_path).await?;
            }
            None => {}
        }

        let generation = new_generation(&info.run_id);
        let dir = key.child(generation.as_str());
        let mut tables = Vec::with_capacity(3);
        for (table, source) in artifact.tables() {
            let file = self.table_file(identity, table);
            match self.upload(source, dir.child(file.as_str())).await {
                Ok((size, sha256)) => tables.push(TableDigest {
                    table,
                    file,
                    size,
                    sha256,
                }),
                Err(e) => {
                    self.discard_generation(&dir, &tables).await;
                    return Err(e);
                }
            }
        }

        let entry = CacheEntry {
            format_version: ENTRY_FORMAT_VERSION,
            namespace: namespace.clone(),
            identity: identity.clone(),
            created_at: Utc::now(),
            run_id: info.run_id,
            generation,
            complete: info.chunks_failed == 0,
            chunks_total: info.chunks_total,
            chunks_failed: info.chunks_failed,
            record_count: artifact.record_count,
            tables,
        };

        let payload = PutPayload::from(serde_json::to_vec_pretty(&entry)?);
        match self
            .store
            .put_opts(&entry_path, payload, PutMode::Create.into())
            .await
        {
            Ok(_) => {}
            Err(object_store::Error::AlreadyExists { .. }) => {
                self.discard_generation(&dir, &entry.tables).await;
                return Err(already_present());
            }
            Err(e) => {
                self.discard_generation(&dir, &entry.tables).await;
                return Err(e.into());
            }
        }

        tracing::debug!("Cached {}/{} ({} records)", namespace, identity, entry.record_count);
        Ok(entry)
    }

    async fn get(
        &self,
        namespace: &Namespace,
        identity: &Identity,
        dest_dir: &Path,
    ) -> Result<ArtifactSet, CacheError> {
        let entry = self
            .entry(namespace, identity)
            .await?
            .ok_or_else(|| CacheError::NotFound {
                namespace: namespace.to_string(),
                identity: identity.to_string(),
            })?;

        tokio::fs::create_dir_all(dest_dir).await?;
        let dir = self.generation_path(namespace, identity, &entry.generation);
        let prefix: PathBuf = dest_dir.join(identity.as_str());
        let mut artifact = ArtifactSet::at(&prefix, &self.layout);
        artifact.record_count = entry.record_count;

        for digest in &entry.tables {
            let dest = artifact.path(digest.table).to_path_buf();
            let sha256 = self.download(&dir.child(digest.file.as_str()), &dest).await?;
            if sha256 != digest.sha256 {
                return Err(CacheError::Malformed {
                    namespace: namespace.to_string(),
                    identity: identity.to_string(),
                    message: format!("{} digest mismatch", digest.file),
                });
            }
        }

        Ok(artifact)
    }

    async fn list(&self, namespace: &Namespace) -> Result<Vec<Identity>, CacheError> {
        let listing = match self
            .store
            .list_with_delimiter(Some(&self.namespace_path(namespace)))
            .await
        {
            Ok(listing) => listing,
            Err(object_store::Error::NotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut identities = Vec::new();
        for dir in listing.common_prefixes {
            let Some(name) = dir.filename() else { continue };
            let Ok(identity) = Identity::new(name) else { continue };
            if self.entry(namespace, &identity).await?.is_some() {
                identities.push(identity);
            }
        }
        identities.sort();
        Ok(identities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::local::LocalFileSystem;
    use tempfile::TempDir;

    fn write_artifact(dir: &Path, name: &str, body: &str) -> ArtifactSet {
        let layout = ArtifactLayout::default();
        let prefix = dir.join(name);
        std::fs::write(layout.path_for(&prefix, Table::Records), format!("#CHROM\tPOS\n{}", body)).unwrap();
        std::fs::write(layout.path_for(&prefix, Table::Samples), "#IID\nS1\n").unwrap();
        std::fs::write(layout.path_for(&prefix, Table::Metadata), "plink2 log\n").unwrap();
        ArtifactSet::locate(&prefix, &layout).unwrap()
    }

    fn store(root: &Path) -> ObjectCacheStore {
        std::fs::create_dir_all(root).unwrap();
        ObjectCacheStore::new(
            Arc::new(LocalFileSystem::new_with_prefix(root).unwrap()),
            ObjectPath::default(),
            ArtifactLayout::default(),
        )
    }

    fn info(failed: usize) -> EntryInfo {
        EntryInfo {
            run_id: "run_test".to_string(),
            chunks_total: 4,
            chunks_failed: failed,
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let cache = store(&dir.path().join("cache"));
        let ns = Namespace::new("cohort").unwrap();
        let id = Identity::new("chr1").unwrap();
        let artifact = write_artifact(dir.path(), "unit", "1\t10\n1\t20\n");

        assert!(!cache.has(&ns, &id).await.unwrap());
        let entry = cache.put(&ns, &id, &artifact, info(0)).await.unwrap();
        assert!(entry.complete);
        assert_eq!(entry.record_count, 2);
        assert!(cache.has(&ns, &id).await.unwrap());
        assert!(dir
            .path()
            .join("cache/cohort/chr1")
            .join(&entry.generation)
            .join("chr1.vcf")
            .is_file());

        let restored = cache.get(&ns, &id, &dir.path().join("restore")).await.unwrap();
        for (table, path) in artifact.tables() {
            assert_eq!(
                std::fs::read(path).unwrap(),
                std::fs::read(restored.path(table)).unwrap()
            );
        }
        assert_eq!(restored.record_count, 2);
    }

    #[tokio::test]
    async fn test_second_put_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = store(&dir.path().join("cache"));
        let ns = Namespace::new("cohort").unwrap();
        let id = Identity::new("chr2").unwrap();
        let artifact = write_artifact(dir.path(), "unit", "2\t5\n");

        cache.put(&ns, &id, &artifact, info(1)).await.unwrap();
        let err = cache.put(&ns, &id, &artifact, info(0)).await.unwrap_err();
        assert!(matches!(err, CacheError::AlreadyPresent { .. }));

        let entry = cache.entry(&ns, &id).await.unwrap().unwrap();
        assert!(!entry.complete, "original entry must be untouched");
        assert_eq!(entry.failed_fraction(), 0.25);
    }

    #[tokio::test]
    async fn test_tables_without_entry_are_a_miss() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        let cache = store(&root);
        let ns = Namespace::new("cohort").unwrap();
        let id = Identity::new("chr3").unwrap();

        // Interrupted put: tables present, entry.json missing
        std::fs::create_dir_all(root.join("cohort/chr3/run_old-0")).unwrap();
        std::fs::write(root.join("cohort/chr3/run_old-0/chr3.vcf"), "#CHROM\n").unwrap();
        assert!(!cache.has(&ns, &id).await.unwrap());

        let artifact = write_artifact(dir.path(), "unit", "3\t1\n");
        cache.put(&ns, &id, &artifact, info(0)).await.unwrap();
        assert!(cache.has(&ns, &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_truncated_table_invalidates_entry() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        let cache = store(&root);
        let ns = Namespace::new("cohort").unwrap();
        let id = Identity::new("chr4").unwrap();
        let artifact = write_artifact(dir.path(), "unit", "4\t1\n4\t2\n");
        let entry = cache.put(&ns, &id, &artifact, info(0)).await.unwrap();

        std::fs::write(
            root.join("cohort/chr4").join(&entry.generation).join("chr4.vcf"),
            "#CHROM\n",
        )
        .unwrap();
        assert!(!cache.has(&ns, &id).await.unwrap());
    }

    fn record_tables(dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                found.extend(record_tables(&path));
            } else if path.extension().is_some_and(|e| e == "vcf") {
                found.push(path);
            }
        }
        found
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_commit_exactly_one_artifact() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        let cache = Arc::new(store(&root));
        let ns = Namespace::new("cohort").unwrap();

        for round in 0..20 {
            let id = Identity::new(format!("chr{}", round + 1)).unwrap();
            let a = write_artifact(dir.path(), &format!("a{}", round), "1\t10\n");
            let b = write_artifact(dir.path(), &format!("b{}", round), "1\t10\n1\t20\n1\t30\n");

            let spawn_put = |artifact: ArtifactSet| {
                let cache = cache.clone();
                let (ns, id) = (ns.clone(), id.clone());
                tokio::spawn(async move { cache.put(&ns, &id, &artifact, info(0)).await })
            };
            let first = spawn_put(a.clone());
            let second = spawn_put(b.clone());
            let results = [first.await.unwrap(), second.await.unwrap()];

            let committed: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
            assert_eq!(committed.len(), 1, "round {}: exactly one put commits", round);
            assert!(results.iter().any(|r| matches!(r, Err(CacheError::AlreadyPresent { .. }))));

            let winner = if committed[0].record_count == 1 { &a } else { &b };
            let restored = cache
                .get(&ns, &id, &dir.path().join(format!("restore{}", round)))
                .await
                .unwrap();
            assert_eq!(
                std::fs::read(winner.path(Table::Records)).unwrap(),
                std::fs::read(restored.path(Table::Records)).unwrap(),
                "round {}: committed tables were overwritten",
                round
            );
            assert_eq!(&cache.entry(&ns, &id).await.unwrap().unwrap(), committed[0]);
            assert_eq!(record_tables(&root.join("cohort").join(id.as_str())).len(), 1);
        }
    }

    #[tokio::test]
    async fn test_list_namespace_in_canonical_order() {
        let dir = TempDir::new().unwrap();
        let cache = store(&dir.path().join("cache"));
        let ns = Namespace::new("cohort").unwrap();
        let other = Namespace::new("other").unwrap();
        let artifact = write_artifact(dir.path(), "unit", "1\t1\n");

        for name in ["chr10", "chr2", "chrX"] {
            let id = Identity::new(name).unwrap();
            cache.put(&ns, &id, &artifact, info(0)).await.unwrap();
        }
        cache
            .put(&other, &Identity::new("chr1").unwrap(), &artifact, info(0))
            .await
            .unwrap();

        let listed: Vec<String> = cache
            .list(&ns)
            .await
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(listed, vec!["chr2", "chr10", "chrX"]);
        assert!(cache.list(&Namespace::new("empty").unwrap()).await.unwrap().is_empty());
    }
}

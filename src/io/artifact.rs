//! The fixed-shape table triple produced by the stage pipeline.

use crate::config::ArtifactLayout;
use crate::error::FailureKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One member of the table triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Records,
    Samples,
    Metadata,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Records, Table::Samples, Table::Metadata];
}

impl ArtifactLayout {
    pub fn extension(&self, table: Table) -> &str {
        match table {
            Table::Records => &self.records,
            Table::Samples => &self.samples,
            Table::Metadata => &self.metadata,
        }
    }

    /// `{prefix}.{ext}` without touching dots already present in `prefix`.
    pub fn path_for(&self, prefix: &Path, table: Table) -> PathBuf {
        let mut s = prefix.as_os_str().to_owned();
        s.push(".");
        s.push(self.extension(table));
        PathBuf::from(s)
    }
}

/// Artifact triple located on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    pub prefix: PathBuf,
    pub records: PathBuf,
    pub samples: PathBuf,
    pub metadata: PathBuf,
    pub record_count: u64,
}

impl ArtifactSet {
    /// Describe the triple at `prefix` without inspecting it.
    pub fn at(prefix: &Path, layout: &ArtifactLayout) -> Self {
        Self {
            prefix: prefix.to_path_buf(),
            records: layout.path_for(prefix, Table::Records),
            samples: layout.path_for(prefix, Table::Samples),
            metadata: layout.path_for(prefix, Table::Metadata),
            record_count: 0,
        }
    }

    /// Verify all three tables exist and count the records.
    pub fn locate(prefix: &Path, layout: &ArtifactLayout) -> Result<Self, FailureKind> {
        let mut set = Self::at(prefix, layout);
        for (_, path) in set.tables() {
            if !path.is_file() {
                return Err(FailureKind::MissingOutput {
                    path: path.to_path_buf(),
                });
            }
        }
        set.record_count =
            crate::io::vcf::count_records(&set.records).map_err(|e| FailureKind::Io {
                message: format!("counting records in {}: {}", set.records.display(), e),
            })?;
        Ok(set)
    }

    pub fn path(&self, table: Table) -> &Path {
        match table {
            Table::Records => &self.records,
            Table::Samples => &self.samples,
            Table::Metadata => &self.metadata,
        }
    }

    pub fn tables(&self) -> [(Table, &Path); 3] {
        Table::ALL.map(|t| (t, self.path(t)))
    }
}

//! Genome builds and the reference-data precondition check.
//!
//! The target build is the coordinate system every chunk ends up in. When the
//! input is in a different (source) build, the liftover stage additionally
//! needs the source sequence, its index and a chain file.

use crate::error::PreconditionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A reference genome assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenomeBuild {
    #[serde(alias = "hg19", alias = "b37", alias = "grch37")]
    GRCh37,
    #[serde(alias = "hg38", alias = "b38", alias = "grch38")]
    GRCh38,
}

impl GenomeBuild {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenomeBuild::GRCh37 => "GRCh37",
            GenomeBuild::GRCh38 => "GRCh38",
        }
    }
}

impl fmt::Display for GenomeBuild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenomeBuild {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "grch37" | "hg19" | "b37" | "37" => Ok(GenomeBuild::GRCh37),
            "grch38" | "hg38" | "b38" | "38" => Ok(GenomeBuild::GRCh38),
            other => Err(format!("unknown genome build '{}' (expected GRCh37 or GRCh38)", other)),
        }
    }
}

/// Reference data locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceConfig {
    /// Build the pipeline produces
    #[serde(default = "default_target_build")]
    pub target_build: GenomeBuild,

    /// Build of the input units (defaults to the target build)
    #[serde(default)]
    pub source_build: Option<GenomeBuild>,

    /// Target-build genome sequence
    pub fasta: PathBuf,

    /// Index of the target sequence (default: `{fasta}.fai`)
    #[serde(default)]
    pub fasta_index: Option<PathBuf>,

    /// Source-build genome sequence, needed for liftover
    #[serde(default)]
    pub source_fasta: Option<PathBuf>,

    /// Index of the source sequence (default: `{source_fasta}.fai`)
    #[serde(default)]
    pub source_fasta_index: Option<PathBuf>,

    /// Source-to-target conversion map
    #[serde(default)]
    pub chain: Option<PathBuf>,
}

fn default_target_build() -> GenomeBuild {
    GenomeBuild::GRCh38
}

impl ReferenceConfig {
    /// Build of the input units.
    pub fn source_build(&self) -> GenomeBuild {
        self.source_build.unwrap_or(self.target_build)
    }

    /// Whether a coordinate conversion is needed.
    pub fn needs_liftover(&self) -> bool {
        self.source_build() != self.target_build
    }
}

/// Reference files that passed the precondition check.
#[derive(Debug, Clone)]
pub struct ReferencePaths {
    pub fasta: PathBuf,
    pub fasta_index: PathBuf,
    pub liftover: Option<LiftoverPaths>,
}

/// Files only required when source and target builds differ.
#[derive(Debug, Clone)]
pub struct LiftoverPaths {
    pub source_fasta: PathBuf,
    pub source_fasta_index: PathBuf,
    pub chain: PathBuf,
}

fn index_for(fasta: &Path, explicit: Option<&PathBuf>) -> PathBuf {
    match explicit {
        Some(p) => p.clone(),
        None => {
            let mut s = fasta.as_os_str().to_owned();
            s.push(".fai");
            PathBuf::from(s)
        }
    }
}

fn require(what: &'static str, path: &Path) -> Result<(), PreconditionError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(PreconditionError::MissingReference {
            what,
            path: path.to_path_buf(),
        })
    }
}

/// Verify every reference file the configured builds need.
///
/// Runs before any chunk is scheduled. The first missing file aborts the run.
pub fn check_reference(config: &ReferenceConfig) -> Result<ReferencePaths, PreconditionError> {
    let fasta_index = index_for(&config.fasta, config.fasta_index.as_ref());
    require("reference FASTA", &config.fasta)?;
    require("reference FASTA index", &fasta_index)?;

    let liftover = if config.needs_liftover() {
        let unconfigured = |what| PreconditionError::UnconfiguredReference {
            what,
            source_build: config.source_build().to_string(),
            target_build: config.target_build.to_string(),
        };

        let source_fasta = config
            .source_fasta
            .clone()
            .ok_or_else(|| unconfigured("source-build FASTA"))?;
        let chain = config
            .chain
            .clone()
            .ok_or_else(|| unconfigured("liftover chain file"))?;
        let source_fasta_index = index_for(&source_fasta, config.source_fasta_index.as_ref());

        require("source-build FASTA", &source_fasta)?;
        require("source-build FASTA index", &source_fasta_index)?;
        require("liftover chain file", &chain)?;

        Some(LiftoverPaths {
            source_fasta,
            source_fasta_index,
            chain,
        })
    } else {
        None
    };

    tracing::info!(
        "Reference data present for {}{}",
        config.target_build,
        if liftover.is_some() {
            format!(" (liftover from {})", config.source_build())
        } else {
            String::new()
        }
    );

    Ok(ReferencePaths {
        fasta: config.fasta.clone(),
        fasta_index,
        liftover,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b">1\nACGT\n").unwrap();
        path
    }

    fn config_with(fasta: PathBuf) -> ReferenceConfig {
        ReferenceConfig {
            target_build: GenomeBuild::GRCh38,
            source_build: None,
            fasta,
            fasta_index: None,
            source_fasta: None,
            source_fasta_index: None,
            chain: None,
        }
    }

    #[test]
    fn test_build_parsing() {
        assert_eq!("hg19".parse::<GenomeBuild>().unwrap(), GenomeBuild::GRCh37);
        assert_eq!("GRCh38".parse::<GenomeBuild>().unwrap(), GenomeBuild::GRCh38);
        assert!("hg17".parse::<GenomeBuild>().is_err());
    }

    #[test]
    fn test_target_only_present() {
        let dir = TempDir::new().unwrap();
        let fasta = touch(&dir, "ref.fa");
        touch(&dir, "ref.fa.fai");

        let paths = check_reference(&config_with(fasta)).unwrap();
        assert!(paths.liftover.is_none());
        assert!(paths.fasta_index.ends_with("ref.fa.fai"));
    }

    #[test]
    fn test_missing_index_is_fatal() {
        let dir = TempDir::new().unwrap();
        let fasta = touch(&dir, "ref.fa");

        let err = check_reference(&config_with(fasta)).unwrap_err();
        match err {
            PreconditionError::MissingReference { what, path } => {
                assert_eq!(what, "reference FASTA index");
                assert!(path.ends_with("ref.fa.fai"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_liftover_requires_chain() {
        let dir = TempDir::new().unwrap();
        let fasta = touch(&dir, "ref.fa");
        touch(&dir, "ref.fa.fai");
        let source = touch(&dir, "hg19.fa");
        touch(&dir, "hg19.fa.fai");

        let mut config = config_with(fasta);
        config.source_build = Some(GenomeBuild::GRCh37);
        config.source_fasta = Some(source);

        assert!(matches!(
            check_reference(&config),
            Err(PreconditionError::UnconfiguredReference { .. })
        ));

        config.chain = Some(dir.path().join("hg19ToHg38.over.chain.gz"));
        assert!(matches!(
            check_reference(&config),
            Err(PreconditionError::MissingReference { what: "liftover chain file", .. })
        ));

        touch(&dir, "hg19ToHg38.over.chain.gz");
        let paths = check_reference(&config).unwrap();
        assert!(paths.liftover.is_some());
    }
}

//! Record-count chunking of input units.

use super::discovery::InputUnit;
use super::identity::Identity;
use crate::error::ChunkError;
use crate::io::vcf::{create_gz_writer, VcfReader};
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A bounded, ordered slice of a unit's records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub unit: Identity,
    pub sequence_index: usize,
    pub chunk_id: String,
    /// Gzip VCF holding the unit header followed by this chunk's records
    pub payload: PathBuf,
    pub record_count: usize,
    pub size_bound: usize,
    pub source_path: PathBuf,
}

/// Splits units into chunks of at most `chunk_size` records.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
}

struct OpenChunk {
    writer: GzEncoder<BufWriter<File>>,
    path: PathBuf,
    records: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_id(identity: &Identity, sequence_index: usize) -> String {
        format!("{}_chunk{:05}", identity, sequence_index)
    }

    /// Split a unit into chunk payloads under `unit_dir`.
    ///
    /// Boundaries depend only on the record sequence and `chunk_size`, so the
    /// same content always yields the same chunks. Every chunk but the last
    /// holds exactly `chunk_size` records.
    pub fn split(&self, unit: &InputUnit, unit_dir: &Path) -> Result<Vec<Chunk>, ChunkError> {
        let mut reader = VcfReader::open(&unit.source_path)?;
        std::fs::create_dir_all(unit_dir)?;

        let mut chunks = Vec::new();
        let mut current: Option<OpenChunk> = None;

        while let Some(record) = reader.next_record()? {
            let mut open = match current.take() {
                Some(open) => open,
                None => {
                    let seq = chunks.len();
                    let path = unit_dir.join(format!("{}.vcf.gz", Self::chunk_id(&unit.identity, seq)));
                    let mut writer = create_gz_writer(&path)?;
                    for line in reader.header() {
                        writeln!(writer, "{}", line)?;
                    }
                    OpenChunk {
                        writer,
                        path,
                        records: 0,
                    }
                }
            };

            writeln!(open.writer, "{}", record)?;
            open.records += 1;

            if open.records == self.chunk_size {
                chunks.push(self.finish(unit, chunks.len(), open)?);
            } else {
                current = Some(open);
            }
        }

        if let Some(last) = current.take() {
            chunks.push(self.finish(unit, chunks.len(), last)?);
        }

        if chunks.is_empty() {
            return Err(ChunkError::Empty {
                path: unit.source_path.clone(),
            });
        }

        tracing::info!(
            "Split {} into {} chunks ({} records)",
            unit.identity,
            chunks.len(),
            chunks.iter().map(|c| c.record_count).sum::<usize>()
        );
        Ok(chunks)
    }

    fn finish(
        &self,
        unit: &InputUnit,
        sequence_index: usize,
        open: OpenChunk,
    ) -> Result<Chunk, ChunkError> {
        open.writer.finish()?.flush()?;
        Ok(Chunk {
            unit: unit.identity.clone(),
            sequence_index,
            chunk_id: Self::chunk_id(&unit.identity, sequence_index),
            payload: open.path,
            record_count: open.records,
            size_bound: self.chunk_size,
            source_path: unit.source_path.clone(),
        })
    }

    /// [`split`](Self::split) on the blocking thread pool.
    pub async fn split_blocking(
        &self,
        unit: InputUnit,
        unit_dir: PathBuf,
    ) -> Result<Vec<Chunk>, ChunkError> {
        let chunker = *self;
        tokio::task::spawn_blocking(move || chunker.split(&unit, &unit_dir))
            .await
            .map_err(|e| ChunkError::Io(std::io::Error::other(e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::vcf::tests::{record, write_plain, HEADER};
    use crate::io::vcf::write_gz_vcf;
    use tempfile::TempDir;

    fn unit(path: PathBuf) -> InputUnit {
        InputUnit {
            identity: Identity::new("chr1").unwrap(),
            source_path: path,
            is_cached: false,
            provisional: false,
        }
    }

    fn records_of(chunk: &Chunk) -> Vec<String> {
        let mut reader = VcfReader::open(&chunk.payload).unwrap();
        assert_eq!(reader.header().join("\n") + "\n", HEADER);
        let mut out = Vec::new();
        while let Some(r) = reader.next_record().unwrap() {
            out.push(r);
        }
        out
    }

    #[test]
    fn test_chunks_cover_records_exactly_once() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("chr1.vcf");
        write_plain(&source, 23);
        let expected: Vec<String> = (1..=23).map(record).collect();

        for size in [1, 5, 7, 22, 23, 24, 100] {
            let out = dir.path().join(format!("work_{}", size));
            let chunks = Chunker::new(size).split(&unit(source.clone()), &out).unwrap();

            assert_eq!(chunks.len(), 23usize.div_ceil(size));
            let mut seen = Vec::new();
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.sequence_index, i);
                if i + 1 < chunks.len() {
                    assert_eq!(chunk.record_count, size);
                } else {
                    assert!(chunk.record_count <= size);
                }
                let recs = records_of(chunk);
                assert_eq!(recs.len(), chunk.record_count);
                seen.extend(recs);
            }
            assert_eq!(seen, expected, "chunk size {}", size);
        }
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("chr1.vcf.gz");
        let header: Vec<String> = HEADER.lines().map(String::from).collect();
        let recs: Vec<String> = (1..=10).map(record).collect();
        write_gz_vcf(&source, &header, &recs).unwrap();

        let a = Chunker::new(4).split(&unit(source.clone()), &dir.path().join("a")).unwrap();
        let b = Chunker::new(4).split(&unit(source), &dir.path().join("b")).unwrap();
        assert_eq!(a.len(), 3);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.chunk_id, y.chunk_id);
            assert_eq!(records_of(x), records_of(y));
        }
        assert_eq!(a[2].chunk_id, "chr1_chunk00002");
        assert!(a[2].payload.ends_with("chr1_chunk00002.vcf.gz"));
    }

    #[test]
    fn test_header_only_unit_is_empty() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("chr1.vcf");
        write_plain(&source, 0);
        let err = Chunker::new(10)
            .split(&unit(source), &dir.path().join("w"))
            .unwrap_err();
        assert!(matches!(err, ChunkError::Empty { .. }));
    }

    #[tokio::test]
    async fn test_split_blocking_reports_unparsable() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("chr1.vcf");
        std::fs::write(&source, format!("{}{}\nbroken\n", HEADER, record(1))).unwrap();

        let err = Chunker::new(10)
            .split_blocking(unit(source), dir.path().join("w"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkError::Unparsable { line: 5, .. }));
    }
}

//! Line-level VCF access.
//!
//! Only the framing is interpreted: `#` header lines, the `#CHROM` column
//! line, and tab-separated records. Plain and gzip/bgzip files are both
//! accepted; compression is detected from the magic bytes.

use crate::error::ChunkError;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Minimum number of fixed columns in a VCF record (CHROM..INFO).
pub const MIN_RECORD_FIELDS: usize = 8;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Open a text file, transparently decompressing gzip/bgzip.
pub fn open_text(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    drop(file);

    let file = File::open(path)?;
    if n == 2 && magic == GZIP_MAGIC {
        // bgzip output is a series of gzip members
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Create a gzip-compressed text writer.
pub fn create_gz_writer(path: &Path) -> io::Result<GzEncoder<BufWriter<File>>> {
    let file = File::create(path)?;
    Ok(GzEncoder::new(BufWriter::new(file), Compression::fast()))
}

/// Count data (non-`#`, non-empty) lines of a table.
pub fn count_records(path: &Path) -> io::Result<u64> {
    let mut count = 0;
    for line in open_text(path)?.lines() {
        let line = line?;
        if !line.is_empty() && !line.starts_with('#') {
            count += 1;
        }
    }
    Ok(count)
}

/// Streaming reader over the records of one VCF file.
pub struct VcfReader {
    path: PathBuf,
    lines: io::Lines<Box<dyn BufRead + Send>>,
    line_no: usize,
    header: Vec<String>,
    pending: Option<String>,
}

impl VcfReader {
    /// Open a VCF and read its header.
    ///
    /// Fails with [`ChunkError::Empty`] when there is no content at all and
    /// [`ChunkError::Unparsable`] when the header does not end with `#CHROM`.
    pub fn open(path: &Path) -> Result<Self, ChunkError> {
        let mut reader = Self {
            path: path.to_path_buf(),
            lines: open_text(path)?.lines(),
            line_no: 0,
            header: Vec::new(),
            pending: None,
        };
        reader.read_header()?;
        Ok(reader)
    }

    fn read_header(&mut self) -> Result<(), ChunkError> {
        while let Some(line) = self.next_line()? {
            if line.starts_with('#') {
                self.header.push(line);
            } else {
                self.pending = Some(line);
                break;
            }
        }

        if self.header.is_empty() && self.pending.is_none() {
            return Err(ChunkError::Empty {
                path: self.path.clone(),
            });
        }
        match self.header.last() {
            Some(last) if last.starts_with("#CHROM") => Ok(()),
            _ => Err(self.unparsable("header does not end with a #CHROM column line")),
        }
    }

    fn next_line(&mut self) -> Result<Option<String>, ChunkError> {
        loop {
            match self.lines.next() {
                None => return Ok(None),
                Some(line) => {
                    self.line_no += 1;
                    let line = line.map_err(|e| {
                        if e.kind() == io::ErrorKind::InvalidData {
                            self.unparsable(&e.to_string())
                        } else {
                            ChunkError::Io(e)
                        }
                    })?;
                    let line = line.trim_end_matches('\r');
                    if !line.is_empty() {
                        return Ok(Some(line.to_string()));
                    }
                }
            }
        }
    }

    fn unparsable(&self, reason: &str) -> ChunkError {
        ChunkError::Unparsable {
            path: self.path.clone(),
            line: self.line_no,
            reason: reason.to_string(),
        }
    }

    /// Header lines, ending with the `#CHROM` line.
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Next record line, or `None` at end of file.
    pub fn next_record(&mut self) -> Result<Option<String>, ChunkError> {
        let line = match self.pending.take() {
            Some(line) => line,
            None => match self.next_line()? {
                Some(line) => line,
                None => return Ok(None),
            },
        };

        if line.starts_with('#') {
            return Err(self.unparsable("header line after the first record"));
        }
        let fields = line.split('\t').count();
        if fields < MIN_RECORD_FIELDS {
            return Err(self.unparsable(&format!(
                "record has {} tab-separated fields, expected at least {}",
                fields, MIN_RECORD_FIELDS
            )));
        }
        Ok(Some(line))
    }
}

/// Write a header and records as one gzip VCF.
pub fn write_gz_vcf<'a>(
    path: &Path,
    header: &[String],
    records: impl IntoIterator<Item = &'a String>,
) -> io::Result<()> {
    let mut writer = create_gz_writer(path)?;
    for line in header {
        writeln!(writer, "{}", line)?;
    }
    for record in records {
        writeln!(writer, "{}", record)?;
    }
    writer.finish()?.flush()?;
    Ok(())
}

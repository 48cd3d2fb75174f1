use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceFormat {
    #[default]
    AutoDetect,
    Fasta,
    Fastq,
}

/// One sequencing read or reference record.
///
/// `descriptor` is the header line without its leading `@`/`>`.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub format: SequenceFormat,
    pub descriptor: Vec<u8>,
    pub bases: Vec<u8>,
    pub quality: Option<Vec<u8>>,
}

impl ReadRecord {
    pub fn fasta(descriptor: &[u8], bases: &[u8]) -> Self {
        ReadRecord {
            format: SequenceFormat::Fasta,
            descriptor: descriptor.to_vec(),
            bases: bases.to_vec(),
            quality: None,
        }
    }

    pub fn fastq(descriptor: &[u8], bases: &[u8], quality: &[u8]) -> Self {
        ReadRecord {
            format: SequenceFormat::Fastq,
            descriptor: descriptor.to_vec(),
            bases: bases.to_vec(),
            quality: Some(quality.to_vec()),
        }
    }

    /// Descriptor up to the first whitespace.
    pub fn id(&self) -> &[u8] {
        let end = self
            .descriptor
            .iter()
            .position(|b| b.is_ascii_whitespace())
            .unwrap_or(self.descriptor.len());
        &self.descriptor[..end]
    }

    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    fn clear(&mut self) {
        self.descriptor.clear();
        self.bases.clear();
        self.quality = None;
    }

    /// Writes the record back out in its own format. FASTQ records without
    /// qualities get `I` for every base.
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        match self.format {
            SequenceFormat::Fastq => {
                out.write_all(b"@")?;
                out.write_all(&self.descriptor)?;
                out.write_all(b"\n")?;
                out.write_all(&self.bases)?;
                out.write_all(b"\n+\n")?;
                match &self.quality {
                    Some(q) => out.write_all(q)?,
                    None => out.write_all(&vec![b'I'; self.bases.len()])?,
                }
                out.write_all(b"\n")
            }
            _ => {
                out.write_all(b">")?;
                out.write_all(&self.descriptor)?;
                out.write_all(b"\n")?;
                out.write_all(&self.bases)?;
                out.write_all(b"\n")
            }
        }
    }
}

fn strip_line(line: &mut Vec<u8>) {
    while line.last().is_some_and(|b| b.is_ascii_whitespace()) {
        line.pop();
    }
}

fn malformed(format: SequenceFormat) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
            "malformed {} file",
            if format == SequenceFormat::Fastq {
                "FASTQ"
            } else {
                "FASTA"
            }
        ),
    )
}

/// Streaming FASTA/FASTQ reader with format auto-detection.
pub struct BatchSequenceReader<R: BufRead> {
    reader: R,
    line: Vec<u8>,
    file_format: SequenceFormat,
}

impl BatchSequenceReader<Box<dyn BufRead + Send>> {
    /// Opens a file, transparently decompressing `.gz` input. `-` reads stdin.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let reader: Box<dyn BufRead + Send> = if path == Path::new("-") {
            Box::new(BufReader::new(io::stdin()))
        } else if path.extension().is_some_and(|ext| ext == "gz") {
            Box::new(BufReader::new(MultiGzDecoder::new(File::open(path)?)))
        } else {
            Box::new(BufReader::new(File::open(path)?))
        };
        Ok(Self::new(reader))
    }
}

impl<R: BufRead> BatchSequenceReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::with_capacity(8192),
            file_format: SequenceFormat::AutoDetect,
        }
    }

    pub fn file_format(&self) -> SequenceFormat {
        self.file_format
    }

    fn read_line(&mut self) -> io::Result<bool> {
        self.line.clear();
        if self.reader.read_until(b'\n', &mut self.line)? == 0 {
            return Ok(false);
        }
        strip_line(&mut self.line);
        Ok(true)
    }

    /// Reads the next record into `record`, returning `false` at end of input.
    pub fn next_sequence(&mut self, record: &mut ReadRecord) -> io::Result<bool> {
        record.clear();

        // skip blank lines between records
        loop {
            if !self.read_line()? {
                return Ok(false);
            }
            if !self.line.is_empty() {
                break;
            }
        }

        match (self.file_format, self.line[0]) {
            (SequenceFormat::AutoDetect, b'@') => self.file_format = SequenceFormat::Fastq,
            (SequenceFormat::AutoDetect, b'>') => self.file_format = SequenceFormat::Fasta,
            (SequenceFormat::Fastq, b'@') | (SequenceFormat::Fasta, b'>') => {}
            (SequenceFormat::AutoDetect, _) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unrecognized file format",
                ))
            }
            (format, _) => return Err(malformed(format)),
        }
        record.format = self.file_format;
        record.descriptor.extend_from_slice(&self.line[1..]);

        match self.file_format {
            SequenceFormat::Fastq => {
                if !self.read_line()? {
                    return Err(malformed(SequenceFormat::Fastq));
                }
                record.bases.extend_from_slice(&self.line);
                if !self.read_line()? || self.line.first() != Some(&b'+') {
                    return Err(malformed(SequenceFormat::Fastq));
                }
                if !self.read_line()? {
                    return Err(malformed(SequenceFormat::Fastq));
                }
                record.quality = Some(self.line.clone());
            }
            _ => loop {
                let next = self.reader.fill_buf()?.first().copied();
                if matches!(next, None | Some(b'>')) || !self.read_line()? {
                    break;
                }
                record.bases.extend_from_slice(&self.line);
            },
        }

        Ok(true)
    }

    /// Reads up to `record_count` records. An empty batch means end of input.
    pub fn next_batch(&mut self, record_count: usize) -> io::Result<Vec<ReadRecord>> {
        let mut batch = Vec::with_capacity(record_count);
        let mut record = ReadRecord::default();
        while batch.len() < record_count && self.next_sequence(&mut record)? {
            batch.push(std::mem::take(&mut record));
        }
        Ok(batch)
    }
}

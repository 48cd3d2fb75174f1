use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Writer shared between worker threads. Every call holds the lock for the
/// whole buffer, so lines written in one call never interleave.
#[derive(Clone)]
pub struct ThreadSafeOutput {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ThreadSafeOutput {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Buffered file output; `-` means stdout.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        if path == Path::new("-") {
            Ok(Self::new(BufWriter::new(io::stdout())))
        } else {
            Ok(Self::new(BufWriter::new(File::create(path)?)))
        }
    }

    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_all(buf)
    }

    pub fn write_str(&self, s: &str) -> io::Result<()> {
        self.write_all(s.as_bytes())
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

/// In-memory sink whose contents stay readable after it is handed to a
/// `ThreadSafeOutput`.
#[derive(Clone, Default)]
pub struct CaptureBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.contents())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Destinations of a classification run. Absent sinks are skipped.
#[derive(Clone, Default)]
pub struct OutputSinks {
    /// Per-read Kraken lines.
    pub kraken: Option<ThreadSafeOutput>,
    /// Filtered copy of the classified reads.
    pub classified: Option<ThreadSafeOutput>,
}

impl OutputSinks {
    pub fn flush(&self) -> io::Result<()> {
        if let Some(out) = &self.kraken {
            out.flush()?;
        }
        if let Some(out) = &self.classified {
            out.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_thread_safe_output() {
        let buffer = CaptureBuffer::new();
        let output = ThreadSafeOutput::new(buffer.clone());

        output.write_str("test").unwrap();
        output.flush().unwrap();
        assert_eq!(buffer.contents(), b"test");
    }

    #[test]
    fn test_whole_lines_do_not_interleave() {
        let buffer = CaptureBuffer::new();
        let output = ThreadSafeOutput::new(buffer.clone());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let output = output.clone();
                thread::spawn(move || {
                    let line = format!("{}\n", t.to_string().repeat(50));
                    for _ in 0..100 {
                        output.write_str(&line).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let lines = buffer.lines();
        assert_eq!(lines.len(), 400);
        for line in lines {
            assert_eq!(line.len(), 50);
            let first = line.as_bytes()[0];
            assert!(line.bytes().all(|b| b == first));
        }
    }

    #[test]
    fn test_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let output = ThreadSafeOutput::create(&path).unwrap();
        output.write_str("C\tr1\t9\t4\t9:4\n").unwrap();
        output.flush().unwrap();
        drop(output);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "C\tr1\t9\t4\t9:4\n");
    }
}

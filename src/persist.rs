//! On-disk framing shared by the persisted Bloom filter and k-mer store.
//!
//! Layout: 8-byte magic, format version (u32 LE), k (u32 LE), then the
//! serde body encoded with bincode's standard configuration.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{KmerError, Result};

pub const FORMAT_VERSION: u32 = 1;

pub fn write_header<W: Write>(writer: &mut W, magic: &[u8; 8], k: usize) -> Result<()> {
    writer.write_all(magic)?;
    writer.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    writer.write_u32::<LittleEndian>(k as u32)?;
    Ok(())
}

/// Reads and checks the header, returning the stored k.
pub fn read_header<R: Read>(reader: &mut R, magic: &[u8; 8], path: &Path) -> Result<usize> {
    let mut found = [0u8; 8];
    reader.read_exact(&mut found)?;
    if &found != magic {
        return Err(KmerError::format(path, "bad magic"));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(KmerError::format(
            path,
            format!("unsupported format version {}", version),
        ));
    }
    Ok(reader.read_u32::<LittleEndian>()? as usize)
}

pub fn save_blob<T: Serialize>(path: &Path, magic: &[u8; 8], k: usize, body: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_header(&mut writer, magic, k)?;
    let written =
        bincode::serde::encode_into_std_write(body, &mut writer, bincode::config::standard())?;
    writer.flush()?;
    debug!("wrote {} body bytes to {}", written, path.display());
    Ok(())
}

/// Loads a blob, rejecting it unless it was written with `expected_k`.
pub fn load_blob<T: DeserializeOwned>(
    path: &Path,
    magic: &[u8; 8],
    expected_k: usize,
) -> Result<T> {
    let mut reader = BufReader::new(File::open(path)?);
    let found = read_header(&mut reader, magic, path)?;
    if found != expected_k {
        return Err(KmerError::KMismatch {
            expected: expected_k,
            found,
        });
    }
    let body: T = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MAGIC: &[u8; 8] = b"TESTBLOB";

    #[test]
    fn test_header_round_trip() {
        let mut buf = Vec::new();
        write_header(&mut buf, MAGIC, 21).unwrap();
        assert_eq!(buf.len(), 16);
        let k = read_header(&mut Cursor::new(&buf), MAGIC, Path::new("mem")).unwrap();
        assert_eq!(k, 21);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = Vec::new();
        write_header(&mut buf, b"OTHERBLB", 21).unwrap();
        let err = read_header(&mut Cursor::new(&buf), MAGIC, Path::new("mem")).unwrap_err();
        assert!(matches!(err, KmerError::Format { .. }));
    }

    #[test]
    fn test_blob_k_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        save_blob(&path, MAGIC, 31, &vec![1u64, 2, 3]).unwrap();
        let loaded: Vec<u64> = load_blob(&path, MAGIC, 31).unwrap();
        assert_eq!(loaded, vec![1, 2, 3]);
        let err = load_blob::<Vec<u64>>(&path, MAGIC, 25).unwrap_err();
        assert!(matches!(
            err,
            KmerError::KMismatch {
                expected: 25,
                found: 31
            }
        ));
    }

    #[test]
    fn test_truncated_blob() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        save_blob(&path, MAGIC, 5, &vec![7u64; 100]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(load_blob::<Vec<u64>>(&path, MAGIC, 5).is_err());
    }
}

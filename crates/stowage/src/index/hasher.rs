use crate::error::{Result, StowageError};
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

const BUFFER_SIZE: usize = 8192;

pub const DEFAULT_SAMPLE_BYTES: u64 = 64 * 1024;

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            StowageError::FileNotFound(path.to_path_buf())
        } else {
            log::error!("Failed to open file for hashing: {}: {}", path.display(), e);
            StowageError::Io(e)
        }
    })
}

/// Cheap identity hint: MD5 over the file size plus the first and last
/// `sample_bytes` of content, rendered as `<size>-<hex>`.
///
/// Files no larger than two samples are hashed whole, so equal content always
/// gives an equal token.
pub fn quick_fingerprint<P: AsRef<Path>>(path: P, sample_bytes: u64) -> Result<String> {
    let path = path.as_ref();
    let mut file = open(path)?;
    let size = file.metadata()?.len();

    let mut hasher = Md5::new();
    hasher.update(size.to_le_bytes());

    if size <= sample_bytes.saturating_mul(2) {
        feed(&mut hasher, &mut file, size)?;
    } else {
        feed(&mut hasher, &mut file, sample_bytes)?;
        file.seek(SeekFrom::Start(size - sample_bytes))?;
        feed(&mut hasher, &mut file, sample_bytes)?;
    }

    Ok(format!("{}-{:x}", size, hasher.finalize()))
}

fn feed(hasher: &mut Md5, file: &mut File, limit: u64) -> Result<()> {
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file.take(limit));
    let mut buffer = [0u8; BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(())
}

/// Content identity: blake3 over the whole file, streamed in fixed-size
/// chunks.
pub fn full_fingerprint<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let file = open(path)?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

pub fn fingerprint_matches<P: AsRef<Path>>(path: P, expected: &str) -> Result<bool> {
    let actual = full_fingerprint(path)?;
    Ok(actual.eq_ignore_ascii_case(expected))
}

/// Re-hashes `path` and fails with `SourceChanged` if it no longer matches.
pub fn verify_fingerprint<P: AsRef<Path>>(path: P, expected: &str) -> Result<()> {
    let actual = full_fingerprint(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(StowageError::SourceChanged {
            expected: expected.to_string(),
            actual,
        })
    }
}

//! SHA-256 helpers.
//!
//! All digests in a bundle use the `sha256:<lowercase-hex>` form.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

pub const SHA256_PREFIX: &str = "sha256:";

/// Read buffer used by every streaming hash in the crate.
pub const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Hash bytes, returning `sha256:<hex>`.
pub fn sha256_prefixed(bytes: &[u8]) -> String {
    format_digest(Sha256::digest(bytes).as_slice())
}

/// Finalize a hasher into `sha256:<hex>`.
pub fn finalize_prefixed(hasher: Sha256) -> String {
    format_digest(hasher.finalize().as_slice())
}

fn format_digest(bytes: &[u8]) -> String {
    format!("{}{}", SHA256_PREFIX, hex::encode(bytes))
}

/// Accept both prefixed and bare hex digests.
pub fn normalize_hash(hash: &str) -> String {
    if hash.starts_with(SHA256_PREFIX) {
        hash.to_ascii_lowercase()
    } else {
        format!("{}{}", SHA256_PREFIX, hash.to_ascii_lowercase())
    }
}

/// Stream a reader through SHA-256 in bounded reads.
pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_BYTES];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((finalize_prefixed(hasher), total))
}

/// Stream a file through SHA-256.
pub fn sha256_file(path: &Path) -> io::Result<(String, u64)> {
    sha256_reader(File::open(path)?)
}

/// Writer adapter that hashes and counts everything passing through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Flush and return the inner writer with the digest and byte count.
    pub fn finish(mut self) -> io::Result<(W, String, u64)> {
        self.inner.flush()?;
        Ok((self.inner, finalize_prefixed(self.hasher), self.bytes))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn empty_input_has_well_known_digest() {
        assert_eq!(sha256_prefixed(b""), EMPTY_SHA256);
        let (digest, len) = sha256_reader(io::empty()).unwrap();
        assert_eq!(digest, EMPTY_SHA256);
        assert_eq!(len, 0);
    }

    #[test]
    fn hashing_writer_matches_one_shot_digest() {
        let payload = b"timeline entry\n".repeat(10_000);
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(&payload).unwrap();
        let (out, digest, len) = writer.finish().unwrap();

        assert_eq!(out, payload);
        assert_eq!(len, payload.len() as u64);
        assert_eq!(digest, sha256_prefixed(&payload));
    }

    #[test]
    fn normalize_adds_prefix_once() {
        let bare = "ABCDEF";
        assert_eq!(normalize_hash(bare), "sha256:abcdef");
        assert_eq!(normalize_hash("sha256:abcdef"), "sha256:abcdef");
    }
}

//! Bundle archive codec: deterministic tar, zstd or gzip.
//!
//! Packing writes entries in a fixed order (`manifest.json`, `manifest.sig`,
//! then every other path sorted) with GNU headers, mtime 0, uid/gid 0, and
//! mode 0644. The archive digest is computed while the compressed bytes are
//! written, so the output is never read back.
//!
//! Unpacking detects the compressor from magic bytes and enforces
//! [`ArchiveLimits`]. Only regular files and directories are accepted; every
//! entry path must be relative with no `..` or root components.

use crate::crypto::HashingWriter;
use crate::manifest::{MANIFEST_FILE, SIGNATURE_FILE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
#[cfg(feature = "zstd")]
const ZSTD_LEVEL: i32 = 3;

/// Tar bookkeeping per entry: header, long-name blocks, padding.
const TAR_ENTRY_OVERHEAD: u64 = 4 * 512;
const TAR_TRAILER_SLACK: u64 = 20 * 512;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive io error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown compression '{name}' (expected zstd or gzip)")]
    UnknownCompression { name: String },

    #[error("{path}: not a zstd or gzip archive")]
    UnknownFormat { path: PathBuf },

    #[error("{compression} archives are not supported by this build")]
    UnsupportedCompression { compression: Compression },

    #[error("unsafe entry path '{path}'")]
    UnsafePath { path: String },

    #[error("unsupported entry '{path}' ({kind})")]
    UnsupportedEntry { path: String, kind: String },

    #[error("duplicate entry '{path}'")]
    DuplicateEntry { path: String },

    #[error("{what} exceeds limit of {limit}")]
    LimitExceeded { what: &'static str, limit: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Zstd,
    Gzip,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Zstd => "zstd",
            Compression::Gzip => "gzip",
        }
    }

    /// File extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Zstd => "tar.zst",
            Compression::Gzip => "tar.gz",
        }
    }

    pub fn detect(magic: &[u8]) -> Option<Self> {
        if magic.starts_with(&ZSTD_MAGIC) {
            Some(Compression::Zstd)
        } else if magic.starts_with(&GZIP_MAGIC) {
            Some(Compression::Gzip)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zstd" | "zst" => Ok(Compression::Zstd),
            "gzip" | "gz" => Ok(Compression::Gzip),
            other => Err(ArchiveError::UnknownCompression {
                name: other.to_string(),
            }),
        }
    }
}

/// Resource limits for unpacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLimits {
    /// Compressed archive size.
    pub max_archive_bytes: u64,
    pub max_entry_bytes: u64,
    /// Sum of all entry sizes after decompression.
    pub max_total_bytes: u64,
    pub max_entries: u64,
    pub max_path_len: usize,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_archive_bytes: 16 * 1024 * 1024 * 1024,
            max_entry_bytes: 8 * 1024 * 1024 * 1024,
            max_total_bytes: 32 * 1024 * 1024 * 1024,
            max_entries: 100_000,
            max_path_len: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedArchive {
    pub path: PathBuf,
    /// Compressor actually used; differs from the request after a fallback.
    pub compression: Compression,
    pub size: u64,
    pub sha256: String,
    pub file_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackSummary {
    pub compression: Compression,
    /// Relative paths of extracted files, in archive order.
    pub files: Vec<String>,
    pub total_bytes: u64,
}

/// Pack every regular file under `src` into `out`.
pub fn pack_directory(
    src: &Path,
    out: &Path,
    compression: Compression,
) -> Result<PackedArchive, ArchiveError> {
    let entries = collect_entries(src)?;
    let mut sink = HashingWriter::new(BufWriter::new(File::create(out)?));

    let used = resolve_compression(compression);
    match used {
        #[cfg(feature = "zstd")]
        Compression::Zstd => write_zstd(&mut sink, src, &entries)?,
        _ => write_gzip(&mut sink, src, &entries)?,
    }

    let (writer, sha256, size) = sink.finish()?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;

    Ok(PackedArchive {
        path: out.to_path_buf(),
        compression: used,
        size,
        sha256,
        file_count: entries.len(),
    })
}

/// The compressor `pack_directory` will actually use for a request.
///
/// Falls back to gzip when the crate is built without the `zstd` feature.
pub fn resolve_compression(requested: Compression) -> Compression {
    if requested == Compression::Zstd && !cfg!(feature = "zstd") {
        warn!("built without zstd support, falling back to gzip");
        return Compression::Gzip;
    }
    requested
}

#[cfg(feature = "zstd")]
fn write_zstd<W: Write>(sink: &mut W, src: &Path, entries: &[String]) -> Result<(), ArchiveError> {
    let encoder = zstd::stream::write::Encoder::new(sink, ZSTD_LEVEL)?;
    write_tar(encoder, src, entries)?.finish()?;
    Ok(())
}

fn write_gzip<W: Write>(sink: &mut W, src: &Path, entries: &[String]) -> Result<(), ArchiveError> {
    let encoder = flate2::GzBuilder::new()
        .mtime(0)
        .operating_system(255)
        .write(sink, flate2::Compression::default());
    write_tar(encoder, src, entries)?.finish()?;
    Ok(())
}

fn write_tar<W: Write>(writer: W, src: &Path, entries: &[String]) -> io::Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.mode(tar::HeaderMode::Deterministic);

    for rel in entries {
        let file = File::open(src.join(rel))?;
        let len = file.metadata()?.len();

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(len);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        builder.append_data(&mut header, rel, BufReader::new(file))?;
    }

    builder.into_inner()
}

/// Relative paths of every regular file under `root`, in pack order.
fn collect_entries(root: &Path) -> Result<Vec<String>, ArchiveError> {
    let mut out = Vec::new();
    walk(root, "", &mut out)?;
    out.sort_by(|a, b| pack_rank(a).cmp(&pack_rank(b)).then_with(|| a.cmp(b)));
    Ok(out)
}

fn pack_rank(path: &str) -> u8 {
    match path {
        MANIFEST_FILE => 0,
        SIGNATURE_FILE => 1,
        _ => 2,
    }
}

fn walk(dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<(), ArchiveError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name
            .to_str()
            .ok_or_else(|| ArchiveError::UnsafePath {
                path: name.to_string_lossy().into_owned(),
            })?
            .to_string();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&entry.path(), &rel, out)?;
        } else if file_type.is_file() {
            out.push(rel);
        } else {
            return Err(ArchiveError::UnsupportedEntry {
                path: rel,
                kind: "not a regular file".into(),
            });
        }
    }
    Ok(())
}

/// Sniff the compressor from the first bytes of an archive.
pub fn detect_compression(path: &Path) -> Result<Compression, ArchiveError> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    let n = read_up_to(&mut file, &mut magic)?;
    Compression::detect(&magic[..n]).ok_or_else(|| ArchiveError::UnknownFormat {
        path: path.to_path_buf(),
    })
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Extract `archive` into `dest`, which is created if missing.
pub fn unpack_archive(
    archive: &Path,
    dest: &Path,
    limits: &ArchiveLimits,
) -> Result<UnpackSummary, ArchiveError> {
    let mut file = File::open(archive)?;
    let archive_len = file.metadata()?.len();
    if archive_len > limits.max_archive_bytes {
        return Err(ArchiveError::LimitExceeded {
            what: "archive size",
            limit: limits.max_archive_bytes,
        });
    }

    let mut magic = [0u8; 4];
    let n = read_up_to(&mut file, &mut magic)?;
    let compression = Compression::detect(&magic[..n]).ok_or_else(|| ArchiveError::UnknownFormat {
        path: archive.to_path_buf(),
    })?;
    file.seek(SeekFrom::Start(0))?;

    let reader = BufReader::new(file);
    let decoded_limit = limits
        .max_total_bytes
        .saturating_add(limits.max_entries.saturating_mul(TAR_ENTRY_OVERHEAD))
        .saturating_add(TAR_TRAILER_SLACK);

    fs::create_dir_all(dest)?;
    match compression {
        #[cfg(feature = "zstd")]
        Compression::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(reader)?;
            extract(LimitReader::new(decoder, decoded_limit), dest, limits, compression)
        }
        #[cfg(not(feature = "zstd"))]
        Compression::Zstd => Err(ArchiveError::UnsupportedCompression { compression }),
        Compression::Gzip => {
            let decoder = flate2::read::GzDecoder::new(reader);
            extract(LimitReader::new(decoder, decoded_limit), dest, limits, compression)
        }
    }
}

fn extract<R: Read>(
    reader: R,
    dest: &Path,
    limits: &ArchiveLimits,
    compression: Compression,
) -> Result<UnpackSummary, ArchiveError> {
    let mut archive = tar::Archive::new(reader);
    let mut seen = HashSet::new();
    let mut files = Vec::new();
    let mut total_bytes = 0u64;
    let mut count = 0u64;

    for entry in archive.entries().map_err(map_limit)? {
        let mut entry = entry.map_err(map_limit)?;
        count += 1;
        if count > limits.max_entries {
            return Err(ArchiveError::LimitExceeded {
                what: "entry count",
                limit: limits.max_entries,
            });
        }

        let raw_path = entry.path().map_err(map_limit)?.into_owned();
        let rel = safe_relative_path(&raw_path)?;
        if rel.len() > limits.max_path_len {
            return Err(ArchiveError::LimitExceeded {
                what: "entry path length",
                limit: limits.max_path_len as u64,
            });
        }

        match entry.header().entry_type() {
            tar::EntryType::Regular | tar::EntryType::Continuous => {}
            tar::EntryType::Directory => {
                fs::create_dir_all(dest.join(&rel))?;
                continue;
            }
            other => {
                return Err(ArchiveError::UnsupportedEntry {
                    path: rel,
                    kind: format!("{other:?}"),
                });
            }
        }

        let size = entry.size();
        if size > limits.max_entry_bytes {
            return Err(ArchiveError::LimitExceeded {
                what: "entry size",
                limit: limits.max_entry_bytes,
            });
        }
        total_bytes = total_bytes.saturating_add(size);
        if total_bytes > limits.max_total_bytes {
            return Err(ArchiveError::LimitExceeded {
                what: "total decoded size",
                limit: limits.max_total_bytes,
            });
        }
        if !seen.insert(rel.clone()) {
            return Err(ArchiveError::DuplicateEntry { path: rel });
        }

        let target = dest.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)?;
        io::copy(&mut entry, &mut out).map_err(map_limit)?;
        out.sync_all()?;
        files.push(rel);
    }

    Ok(UnpackSummary {
        compression,
        files,
        total_bytes,
    })
}

fn safe_relative_path(path: &Path) -> Result<String, ArchiveError> {
    let unsafe_path = || ArchiveError::UnsafePath {
        path: path.display().to_string(),
    };
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(unsafe_path)?),
            Component::CurDir => {}
            _ => return Err(unsafe_path()),
        }
    }
    if parts.is_empty() {
        return Err(unsafe_path());
    }
    Ok(parts.join("/"))
}

#[derive(Debug, thiserror::Error)]
#[error("decoded stream exceeds limit of {limit} bytes")]
struct DecodedLimitExceeded {
    limit: u64,
}

fn map_limit(err: io::Error) -> ArchiveError {
    let limit = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<DecodedLimitExceeded>())
        .map(|e| e.limit);
    match limit {
        Some(limit) => ArchiveError::LimitExceeded {
            what: "decoded stream",
            limit,
        },
        None => ArchiveError::Io(err),
    }
}

/// Errors once more than `limit` bytes would be read.
struct LimitReader<R> {
    inner: R,
    limit: u64,
    read: u64,
}

impl<R: Read> LimitReader<R> {
    fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            limit,
            read: 0,
        }
    }
}

impl<R: Read> Read for LimitReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.read >= self.limit {
            let mut probe = [0u8; 1];
            return match self.inner.read(&mut probe)? {
                0 => Ok(0),
                _ => Err(io::Error::other(DecodedLimitExceeded { limit: self.limit })),
            };
        }
        let max = (self.limit - self.read).min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..max])?;
        self.read += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256_file;
    use tempfile::TempDir;

    fn staged() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("timeline.json"), b"{\"events\":[]}").unwrap();
        fs::write(dir.path().join("manifest.json"), b"{}").unwrap();
        fs::create_dir_all(dir.path().join("artifacts/a1")).unwrap();
        fs::write(dir.path().join("artifacts/a1/mem.dmp"), vec![7u8; 70_000]).unwrap();
        dir
    }

    #[test]
    fn test_pack_order_puts_manifest_first() {
        let dir = staged();
        let entries = collect_entries(dir.path()).unwrap();
        assert_eq!(
            entries,
            vec!["manifest.json", "artifacts/a1/mem.dmp", "timeline.json"]
        );
    }

    #[test]
    fn test_pack_is_deterministic() {
        let dir = staged();
        let out = TempDir::new().unwrap();
        for compression in [Compression::Zstd, Compression::Gzip] {
            let a = pack_directory(dir.path(), &out.path().join("a"), compression).unwrap();
            let b = pack_directory(dir.path(), &out.path().join("b"), compression).unwrap();
            assert_eq!(a.sha256, b.sha256, "{compression}");
            assert_eq!(a.compression, compression);
            assert_eq!(sha256_file(&a.path).unwrap(), (a.sha256.clone(), a.size));
        }
    }

    #[test]
    fn test_resolve_compression_follows_build_features() {
        assert_eq!(resolve_compression(Compression::Gzip), Compression::Gzip);
        let expected = if cfg!(feature = "zstd") {
            Compression::Zstd
        } else {
            Compression::Gzip
        };
        assert_eq!(resolve_compression(Compression::Zstd), expected);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn test_unpack_restores_tree() {
        let dir = staged();
        let out = TempDir::new().unwrap();
        let archive = out.path().join("bundle.tar.zst");
        pack_directory(dir.path(), &archive, Compression::Zstd).unwrap();

        let dest = out.path().join("x");
        let summary = unpack_archive(&archive, &dest, &ArchiveLimits::default()).unwrap();
        assert_eq!(summary.compression, Compression::Zstd);
        assert_eq!(summary.files.len(), 3);
        assert_eq!(
            fs::read(dest.join("artifacts/a1/mem.dmp")).unwrap(),
            vec![7u8; 70_000]
        );
        assert_eq!(detect_compression(&archive).unwrap(), Compression::Zstd);
    }

    #[test]
    fn test_unpack_enforces_entry_limit() {
        let dir = staged();
        let out = TempDir::new().unwrap();
        let archive = out.path().join("bundle.tar.gz");
        pack_directory(dir.path(), &archive, Compression::Gzip).unwrap();

        let limits = ArchiveLimits {
            max_entry_bytes: 1024,
            ..ArchiveLimits::default()
        };
        let err = unpack_archive(&archive, &out.path().join("x"), &limits).unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::LimitExceeded {
                what: "entry size",
                ..
            }
        ));
    }

    #[test]
    fn test_unpack_rejects_unknown_format() {
        let out = TempDir::new().unwrap();
        let bogus = out.path().join("bogus.tar");
        fs::write(&bogus, b"plain text").unwrap();
        let err = unpack_archive(&bogus, &out.path().join("x"), &ArchiveLimits::default())
            .unwrap_err();
        assert!(matches!(err, ArchiveError::UnknownFormat { .. }));
    }

    #[test]
    fn test_unpack_rejects_symlink_entry() {
        let out = TempDir::new().unwrap();
        let archive = out.path().join("evil.tar.gz");
        let file = File::create(&archive).unwrap();
        let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder
            .append_link(&mut header, "timeline.json", "/etc/passwd")
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = unpack_archive(&archive, &out.path().join("x"), &ArchiveLimits::default())
            .unwrap_err();
        assert!(matches!(err, ArchiveError::UnsupportedEntry { .. }));
    }

    #[test]
    fn test_safe_relative_path() {
        assert!(safe_relative_path(Path::new("../etc/passwd")).is_err());
        assert!(safe_relative_path(Path::new("/etc/passwd")).is_err());
        assert_eq!(
            safe_relative_path(Path::new("./artifacts/a/b")).unwrap(),
            "artifacts/a/b"
        );
    }

    #[test]
    fn test_compression_parse() {
        assert_eq!("ZSTD".parse::<Compression>().unwrap(), Compression::Zstd);
        assert_eq!("gz".parse::<Compression>().unwrap(), Compression::Gzip);
        assert!("lz4".parse::<Compression>().is_err());
    }
}

//! Canonical JSON and digest primitives shared by manifests and signatures.

pub mod digest;
pub mod jcs;

pub use digest::{
    finalize_prefixed, normalize_hash, sha256_file, sha256_prefixed, sha256_reader,
    HashingWriter, READ_BUFFER_BYTES, SHA256_PREFIX,
};

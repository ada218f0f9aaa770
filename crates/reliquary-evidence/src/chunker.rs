//! Fixed-size streaming chunker.
//!
//! Input is consumed in bounded reads of [`READ_BUFFER_BYTES`]; chunk payloads
//! are never buffered whole. Each chunk gets its own SHA-256 while the
//! whole-stream digest is computed in the same pass. The last chunk may be
//! smaller than the chunk size, and empty input produces zero chunks.

use crate::crypto::{finalize_prefixed, READ_BUFFER_BYTES};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};

pub const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("chunk size of {megabytes} MB overflows")]
    ChunkSizeOverflow { megabytes: u64 },

    #[error("io error while chunking: {0}")]
    Io(#[from] io::Error),
}

/// Digest of one chunk within a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDigest {
    /// Position of the chunk within the stream, starting at 0.
    pub index: u64,
    /// Byte offset of the chunk within the stream.
    pub offset: u64,
    pub size: u64,
    pub sha256: String,
}

/// Result of chunking one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSummary {
    pub chunks: Vec<ChunkDigest>,
    pub overall_sha256: String,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingChunker {
    chunk_size: u64,
}

impl StreamingChunker {
    pub fn new(chunk_size: u64) -> Result<Self, ChunkError> {
        if chunk_size == 0 {
            return Err(ChunkError::ZeroChunkSize);
        }
        Ok(Self { chunk_size })
    }

    pub fn from_megabytes(megabytes: u64) -> Result<Self, ChunkError> {
        let bytes = megabytes
            .checked_mul(BYTES_PER_MB)
            .ok_or(ChunkError::ChunkSizeOverflow { megabytes })?;
        Self::new(bytes)
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Chunk a stream, discarding the payload.
    pub fn chunk<R: Read>(&self, reader: R) -> Result<ChunkSummary, ChunkError> {
        self.chunk_into(reader, io::sink())
    }

    /// Chunk a stream while copying every byte to `writer`.
    ///
    /// This is the single read pass used when staging files: the copy, the
    /// per-chunk digests, and the whole-file digest all come out of it.
    pub fn chunk_into<R: Read, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
    ) -> Result<ChunkSummary, ChunkError> {
        let mut buf = vec![0u8; READ_BUFFER_BYTES];
        let mut overall = Sha256::new();
        let mut current = Sha256::new();
        let mut current_len = 0u64;
        let mut total = 0u64;
        let mut chunks = Vec::new();

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            let mut rest = &buf[..n];
            while !rest.is_empty() {
                let room = self.chunk_size - current_len;
                let take = rest.len().min(usize::try_from(room).unwrap_or(usize::MAX));
                let (head, tail) = rest.split_at(take);

                current.update(head);
                overall.update(head);
                writer.write_all(head)?;
                current_len += take as u64;
                rest = tail;

                if current_len == self.chunk_size {
                    let finished = std::mem::replace(&mut current, Sha256::new());
                    chunks.push(ChunkDigest {
                        index: chunks.len() as u64,
                        offset: total,
                        size: current_len,
                        sha256: finalize_prefixed(finished),
                    });
                    total += current_len;
                    current_len = 0;
                }
            }
        }

        if current_len > 0 {
            chunks.push(ChunkDigest {
                index: chunks.len() as u64,
                offset: total,
                size: current_len,
                sha256: finalize_prefixed(current),
            });
            total += current_len;
        }

        writer.flush()?;

        Ok(ChunkSummary {
            chunks,
            overall_sha256: finalize_prefixed(overall),
            total_bytes: total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256_prefixed;
    use std::io::Cursor;

    fn patterned(len: usize) -> Vec<u8> {
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect()
    }

    /// Reader that hands out at most `step` bytes per call.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.data.len().min(self.step).min(buf.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(matches!(
            StreamingChunker::new(0),
            Err(ChunkError::ZeroChunkSize)
        ));
        assert!(matches!(
            StreamingChunker::from_megabytes(u64::MAX),
            Err(ChunkError::ChunkSizeOverflow { .. })
        ));
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        let summary = StreamingChunker::new(16).unwrap().chunk(io::empty()).unwrap();
        assert!(summary.chunks.is_empty());
        assert_eq!(summary.total_bytes, 0);
        assert_eq!(summary.overall_sha256, sha256_prefixed(b""));
    }

    #[test]
    fn test_exact_multiple_has_no_partial_chunk() {
        let data = patterned(64);
        let summary = StreamingChunker::new(16)
            .unwrap()
            .chunk(Cursor::new(&data))
            .unwrap();
        assert_eq!(summary.chunks.len(), 4);
        assert!(summary.chunks.iter().all(|c| c.size == 16));
    }

    #[test]
    fn test_remainder_becomes_final_partial_chunk() {
        let data = patterned(350);
        let summary = StreamingChunker::new(100)
            .unwrap()
            .chunk(Cursor::new(&data))
            .unwrap();
        let sizes: Vec<u64> = summary.chunks.iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![100, 100, 100, 50]);
        let offsets: Vec<u64> = summary.chunks.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 100, 200, 300]);
    }

    #[test]
    fn test_chunks_tile_the_stream_for_many_sizes() {
        let data = patterned(READ_BUFFER_BYTES * 2 + 777);
        for chunk_size in [1u64, 7, 1000, 65_536, 65_537, 1 << 20] {
            let chunker = StreamingChunker::new(chunk_size).unwrap();
            let mut copy = Vec::new();
            let summary = chunker
                .chunk_into(Trickle { data: &data, step: 4093 }, &mut copy)
                .unwrap();

            assert_eq!(copy, data, "copy must be byte-identical");
            assert_eq!(summary.total_bytes, data.len() as u64);
            assert_eq!(
                summary.chunks.iter().map(|c| c.size).sum::<u64>(),
                data.len() as u64
            );

            let mut rebuilt = Vec::with_capacity(data.len());
            for (i, chunk) in summary.chunks.iter().enumerate() {
                assert_eq!(chunk.index, i as u64);
                let start = chunk.offset as usize;
                let slice = &data[start..start + chunk.size as usize];
                assert_eq!(chunk.sha256, sha256_prefixed(slice));
                rebuilt.extend_from_slice(slice);
            }
            assert_eq!(rebuilt, data, "chunk_size={chunk_size}");
            assert_eq!(summary.overall_sha256, sha256_prefixed(&data));
        }
    }

    #[test]
    fn test_from_megabytes() {
        let chunker = StreamingChunker::from_megabytes(256).unwrap();
        assert_eq!(chunker.chunk_size(), 256 * BYTES_PER_MB);
    }
}

//! Lazy chunking of a source byte stream.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use stowage_types::{ChunkDescriptor, DEFAULT_CHUNK_SIZE};

use crate::TransferError;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// One chunk of object data with its descriptor.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub descriptor: ChunkDescriptor,
    pub data: Vec<u8>,
}

/// Cuts a source reader into fixed-size ordered chunks.
///
/// Forward-only and non-restartable: every call to [`next_chunk`] consumes
/// source bytes. Sequence numbers are contiguous from 0 and offsets cover
/// exactly `[0, total)`.
///
/// When `expected_len` is known, only the final chunk may be shorter than
/// `chunk_size`, and a source that ends before `expected_len` fails with
/// [`TransferError::ShortRead`]. When the length is unknown (live upload),
/// the first short read is taken as the clean end of the stream.
///
/// [`next_chunk`]: ChunkStream::next_chunk
pub struct ChunkStream<R> {
    source: R,
    chunk_size: usize,
    expected_len: Option<u64>,
    offset: u64,
    next_sequence: u64,
    verify_checksums: bool,
    finished: bool,
}

impl<R: AsyncRead + Unpin + Send> ChunkStream<R> {
    /// Creates a stream over `source`.
    ///
    /// If `chunk_size` is 0, the engine default (16 MiB) is used.
    pub fn new(
        source: R,
        chunk_size: usize,
        expected_len: Option<u64>,
        verify_checksums: bool,
    ) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            source,
            chunk_size,
            expected_len,
            offset: 0,
            next_sequence: 0,
            verify_checksums,
            finished: false,
        }
    }

    /// Reads the next chunk. Returns `None` at the clean end of the stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        if self.finished {
            return Ok(None);
        }

        let want = match self.expected_len {
            Some(total) => {
                let remaining = total - self.offset;
                if remaining == 0 {
                    self.finished = true;
                    return Ok(None);
                }
                remaining.min(self.chunk_size as u64) as usize
            }
            None => self.chunk_size,
        };

        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.source.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            // EOF on a chunk boundary.
            self.finished = true;
            return match self.expected_len {
                Some(total) if self.offset < total => Err(TransferError::ShortRead {
                    expected: total,
                    received: self.offset,
                }),
                _ => Ok(None),
            };
        }

        if filled < want {
            match self.expected_len {
                // The source closed mid-chunk without a clean end-of-stream.
                Some(total) => {
                    self.finished = true;
                    return Err(TransferError::ShortRead {
                        expected: total,
                        received: self.offset + filled as u64,
                    });
                }
                // Unknown length: a short chunk is the last chunk.
                None => self.finished = true,
            }
        }
        buf.truncate(filled);

        let checksum = self.verify_checksums.then(|| checksum_bytes(&buf));
        let descriptor = ChunkDescriptor {
            sequence: self.next_sequence,
            offset: self.offset,
            length: filled as u64,
            checksum,
        };
        self.offset += filled as u64;
        self.next_sequence += 1;

        Ok(Some(Chunk {
            descriptor,
            data: buf,
        }))
    }

    /// Bytes consumed from the source so far.
    pub fn bytes_read(&self) -> u64 {
        self.offset
    }

    /// Number of chunks produced so far.
    pub fn chunks_produced(&self) -> u64 {
        self.next_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn collect(stream: &mut ChunkStream<Cursor<Vec<u8>>>) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(c) = stream.next_chunk().await.unwrap() {
            chunks.push(c);
        }
        chunks
    }

    #[tokio::test]
    async fn produces_ceil_s_over_c_contiguous_chunks() {
        // Property over a grid of sizes: ceil(S/C) chunks, contiguous,
        // non-overlapping, covering exactly [0, S).
        for (size, chunk_size) in [(10usize, 4usize), (16, 4), (1, 4), (250, 16), (7, 7)] {
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let mut stream =
                ChunkStream::new(Cursor::new(data.clone()), chunk_size, Some(size as u64), false);
            let chunks = collect(&mut stream).await;

            assert_eq!(chunks.len(), size.div_ceil(chunk_size));
            let mut expected_offset = 0u64;
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.descriptor.sequence, i as u64);
                assert_eq!(chunk.descriptor.offset, expected_offset);
                assert_eq!(chunk.descriptor.length, chunk.data.len() as u64);
                expected_offset = chunk.descriptor.end_offset();
            }
            assert_eq!(expected_offset, size as u64);

            let reassembled: Vec<u8> =
                chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
            assert_eq!(reassembled, data);
        }
    }

    #[tokio::test]
    async fn unknown_length_short_chunk_ends_stream() {
        let data = b"0123456789".to_vec(); // 10 bytes, chunk 4.
        let mut stream = ChunkStream::new(Cursor::new(data), 4, None, false);

        let c1 = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(&c1.data, b"0123");
        let c2 = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(&c2.data, b"4567");
        let c3 = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(&c3.data, b"89");
        assert!(stream.next_chunk().await.unwrap().is_none());
        // Forward-only: stays ended.
        assert!(stream.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_length_exact_multiple() {
        let data = b"01234567".to_vec(); // exactly 2 chunks of 4.
        let mut stream = ChunkStream::new(Cursor::new(data), 4, None, false);
        assert!(stream.next_chunk().await.unwrap().is_some());
        assert!(stream.next_chunk().await.unwrap().is_some());
        assert!(stream.next_chunk().await.unwrap().is_none());
        assert_eq!(stream.bytes_read(), 8);
        assert_eq!(stream.chunks_produced(), 2);
    }

    #[tokio::test]
    async fn known_length_truncated_source_fails_short_read() {
        // Declares 12 bytes but the source only has 6.
        let data = b"012345".to_vec();
        let mut stream = ChunkStream::new(Cursor::new(data), 4, Some(12), false);

        let c1 = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(c1.descriptor.length, 4);

        let err = stream.next_chunk().await.unwrap_err();
        match err {
            TransferError::ShortRead { expected, received } => {
                assert_eq!(expected, 12);
                assert_eq!(received, 6);
            }
            other => panic!("expected ShortRead, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn checksums_computed_when_enabled() {
        let data = b"hello world".to_vec();
        let mut stream = ChunkStream::new(Cursor::new(data.clone()), 64, Some(11), true);
        let chunk = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk.descriptor.checksum.as_deref(), Some(checksum_bytes(&data).as_str()));

        let mut plain = ChunkStream::new(Cursor::new(data), 64, Some(11), false);
        let chunk = plain.next_chunk().await.unwrap().unwrap();
        assert!(chunk.descriptor.checksum.is_none());
    }

    #[test]
    fn checksum_is_deterministic_hex_sha256() {
        let c1 = checksum_bytes(b"data");
        let c2 = checksum_bytes(b"data");
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64);
        assert_ne!(c1, checksum_bytes(b"Data"));
    }
}

// World snapshot transfer for joining clients.
//
// The simulation's snapshot is an opaque blob. Before sending, it is
// optionally zlib-compressed and prefixed with `COMPRESSED_TAG`; a blob
// without the tag is passed to the loader unchanged. The encoded bytes are
// split into `SNAPSHOT_CHUNK_SIZE` pieces, each sent as its own MAP packet
// carrying the total size and its byte offset.
//
// `SnapshotReceiver` allocates the full buffer on the first chunk and
// tracks which offsets it has seen, so chunks may arrive in any order. The
// transfer is complete once every byte is covered.

use std::io::{Read, Write};
use std::ops::Range;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use parklink_protocol::ServerMessage;

use crate::error::{NetError, NetResult};

pub const SNAPSHOT_CHUNK_SIZE: usize = 65000;

/// Marks a zlib-compressed snapshot.
pub const COMPRESSED_TAG: &[u8] = b"PARKLINK_ZLIB\0";

/// Largest snapshot a client will allocate a buffer for.
pub const MAX_SNAPSHOT_SIZE: u32 = 256 * 1024 * 1024;

pub fn encode_snapshot(blob: &[u8], compress: bool) -> NetResult<Vec<u8>> {
    if !compress {
        return Ok(blob.to_vec());
    }
    let mut encoder = ZlibEncoder::new(COMPRESSED_TAG.to_vec(), Compression::default());
    encoder
        .write_all(blob)
        .map_err(|e| NetError::Snapshot(format!("compression failed: {e}")))?;
    let out = encoder
        .finish()
        .map_err(|e| NetError::Snapshot(format!("compression finish failed: {e}")))?;
    tracing::debug!(raw = blob.len(), encoded = out.len(), "compressed snapshot");
    Ok(out)
}

/// Undo `encode_snapshot`. Untagged data is returned as-is.
pub fn decode_snapshot(data: &[u8]) -> NetResult<Vec<u8>> {
    let Some(compressed) = data.strip_prefix(COMPRESSED_TAG) else {
        return Ok(data.to_vec());
    };
    let mut out = Vec::new();
    ZlibDecoder::new(compressed)
        .read_to_end(&mut out)
        .map_err(|e| NetError::Snapshot(format!("decompression failed: {e}")))?;
    tracing::debug!(encoded = data.len(), raw = out.len(), "decompressed snapshot");
    Ok(out)
}

/// Split encoded snapshot bytes into MAP messages.
pub fn chunk_snapshot(encoded: &[u8]) -> Vec<ServerMessage> {
    let total_size = encoded.len() as u32;
    if encoded.is_empty() {
        return vec![ServerMessage::Map {
            total_size,
            offset: 0,
            chunk: Vec::new(),
        }];
    }
    encoded
        .chunks(SNAPSHOT_CHUNK_SIZE)
        .enumerate()
        .map(|(i, chunk)| ServerMessage::Map {
            total_size,
            offset: (i * SNAPSHOT_CHUNK_SIZE) as u32,
            chunk: chunk.to_vec(),
        })
        .collect()
}

/// Reassembles MAP chunks.
#[derive(Debug, Default)]
pub struct SnapshotReceiver {
    buffer: Vec<u8>,
    total: Option<u32>,
    /// Sorted, disjoint byte ranges filled so far.
    covered: Vec<Range<usize>>,
}

impl SnapshotReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a transfer has started and not yet completed.
    pub fn in_progress(&self) -> bool {
        self.total.is_some()
    }

    /// Take one chunk. Returns the full encoded snapshot once every byte
    /// has arrived, and resets for the next transfer.
    pub fn accept(&mut self, total_size: u32, offset: u32, chunk: &[u8]) -> NetResult<Option<Vec<u8>>> {
        if total_size > MAX_SNAPSHOT_SIZE {
            return Err(NetError::Snapshot(format!(
                "snapshot of {total_size} bytes exceeds limit"
            )));
        }
        match self.total {
            Some(total) if total != total_size => {
                tracing::warn!(
                    previous = total,
                    total_size,
                    "snapshot size changed mid-transfer, restarting"
                );
                self.reset();
                self.begin(total_size);
            }
            Some(_) => {}
            None => self.begin(total_size),
        }

        let start = offset as usize;
        let end = start + chunk.len();
        if end > self.buffer.len() {
            return Err(NetError::Snapshot(format!(
                "chunk at {offset}+{} overruns snapshot of {total_size} bytes",
                chunk.len()
            )));
        }
        self.buffer[start..end].copy_from_slice(chunk);
        self.cover(start..end);

        let received: usize = self.covered.iter().map(|r| r.len()).sum();
        if received < self.buffer.len() {
            return Ok(None);
        }
        let data = std::mem::take(&mut self.buffer);
        self.reset();
        Ok(Some(data))
    }

    /// Merge `range` into the covered set, joining neighbours it touches.
    fn cover(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        self.covered.retain(|r| {
            if r.end < merged.start || r.start > merged.end {
                return true;
            }
            merged.start = merged.start.min(r.start);
            merged.end = merged.end.max(r.end);
            false
        });
        let at = self.covered.partition_point(|r| r.start < merged.start);
        self.covered.insert(at, merged);
    }

    fn begin(&mut self, total_size: u32) {
        self.buffer = vec![0; total_size as usize];
        self.total = Some(total_size);
        tracing::debug!(total_size, "receiving snapshot");
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.total = None;
        self.covered.clear();
    }
}

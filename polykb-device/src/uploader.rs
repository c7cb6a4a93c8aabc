//! Chunked payload upload
//!
//! An arbitrary byte payload is split into protocol-sized chunks, each
//! carrying a destination id and a 2-byte offset, followed by one terminal
//! header-only chunk at the sentinel offset `0xFFFF` that signals "all bytes
//! received, commit/activate". The same chunk shape serves both the
//! acknowledged dynamic-function upload and the best-effort RGB stream; the
//! send policies live on [`crate::Device`].

use polykb_transport::protocol::dyn_payload;
use polykb_transport::Endianness;

/// One upload chunk: `[dest_id:2][offset:2]<data>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub dest_id: u16,
    pub offset: u16,
    pub data: Vec<u8>,
}

impl Chunk {
    /// Whether this is the terminal commit chunk
    pub fn is_commit(&self) -> bool {
        self.offset == dyn_payload::COMMIT_OFFSET
    }

    /// Serialize to a frame payload in the device's byte order
    pub fn to_payload(&self, endian: Endianness) -> Vec<u8> {
        let mut out = Vec::with_capacity(dyn_payload::HEADER_LEN + self.data.len());
        let (dest, off) = match endian {
            Endianness::Little => (self.dest_id.to_le_bytes(), self.offset.to_le_bytes()),
            Endianness::Big => (self.dest_id.to_be_bytes(), self.offset.to_be_bytes()),
        };
        out.extend_from_slice(&dest);
        out.extend_from_slice(&off);
        out.extend_from_slice(&self.data);
        out
    }
}

/// Split `payload` into data chunks sized to `frame_capacity` (which must
/// exceed the chunk header) plus the terminal commit chunk.
pub fn build_chunks(dest_id: u16, payload: &[u8], frame_capacity: usize) -> Vec<Chunk> {
    let capacity = frame_capacity.saturating_sub(dyn_payload::HEADER_LEN).max(1);
    let mut chunks = Vec::with_capacity(payload.len().div_ceil(capacity) + 1);
    for (i, data) in payload.chunks(capacity).enumerate() {
        chunks.push(Chunk {
            dest_id,
            offset: (i * capacity) as u16,
            data: data.to_vec(),
        });
    }
    chunks.push(Chunk {
        dest_id,
        offset: dyn_payload::COMMIT_OFFSET,
        data: Vec::new(),
    });
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_is_ceil_plus_commit() {
        // 100 bytes at 36 net bytes per chunk: ceil(100/36) = 3 data chunks
        let payload = vec![0xAB; 100];
        let chunks = build_chunks(2, &payload, 40);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[1].offset, 36);
        assert_eq!(chunks[2].offset, 72);
        assert_eq!(chunks[2].data.len(), 28);
        assert!(chunks[3].is_commit());
        assert!(chunks[3].data.is_empty());
    }

    #[test]
    fn payload_smaller_than_one_chunk() {
        let chunks = build_chunks(1, &[1, 2, 3], 40);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].data, vec![1, 2, 3]);
        assert!(chunks[1].is_commit());
    }

    #[test]
    fn empty_payload_still_commits() {
        let chunks = build_chunks(1, &[], 40);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_commit());
    }

    #[test]
    fn payload_header_layout() {
        let chunk = Chunk {
            dest_id: 0x0102,
            offset: 0x0304,
            data: vec![0xAA],
        };
        assert_eq!(
            chunk.to_payload(Endianness::Little),
            vec![0x02, 0x01, 0x04, 0x03, 0xAA]
        );
        assert_eq!(
            chunk.to_payload(Endianness::Big),
            vec![0x01, 0x02, 0x03, 0x04, 0xAA]
        );
    }

    #[test]
    fn reassembled_chunks_reproduce_payload() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(777).collect();
        let chunks = build_chunks(9, &payload, 64);
        let mut rebuilt = vec![0u8; payload.len()];
        for chunk in chunks.iter().filter(|c| !c.is_commit()) {
            let off = chunk.offset as usize;
            rebuilt[off..off + chunk.data.len()].copy_from_slice(&chunk.data);
        }
        assert_eq!(rebuilt, payload);
    }
}

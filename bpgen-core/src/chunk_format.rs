use crate::manifest::ChunkId;
use anyhow::{Context, Result};
use crc32fast::Hasher as Crc32;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Chunk file layout (little-endian):
/// magic (8) + header_version (u32) + header_size (u32) + hash_kind (u8)
/// + stored_as (u8) + reserved (2) + id (32) + rolling_hash (u64)
/// + payload_len (u32) + stored_len (u32) + header_crc (u32), then the
/// stored payload bytes.
pub const CHUNK_MAGIC: &[u8; 8] = b"BPCHUNK\0";
pub const CHUNK_HEADER_VERSION: u32 = 1;
pub const CHUNK_HEADER_LEN: usize = 8 + 4 + 4 + 1 + 1 + 2 + 32 + 8 + 4 + 4 + 4;
const CRC_OFFSET: usize = CHUNK_HEADER_LEN - 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashKind {
    RollingPoly64,
}

impl HashKind {
    fn tag(self) -> u8 {
        match self {
            HashKind::RollingPoly64 => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(HashKind::RollingPoly64),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoredAs {
    Raw,
    Zstd,
}

impl StoredAs {
    fn tag(self) -> u8 {
        match self {
            StoredAs::Raw => 0,
            StoredAs::Zstd => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(StoredAs::Raw),
            1 => Some(StoredAs::Zstd),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkFormatError {
    #[error("chunk header truncated ({0} bytes)")]
    Truncated(usize),
    #[error("bad chunk magic")]
    BadMagic,
    #[error("unsupported chunk header version {0}")]
    UnsupportedVersion(u32),
    #[error("chunk header size {0} is smaller than the fixed header")]
    BadHeaderSize(u32),
    #[error("unknown hash kind tag {0}")]
    UnknownHashKind(u8),
    #[error("unsupported storage tag {0}")]
    UnsupportedStorage(u8),
    #[error("chunk header CRC mismatch")]
    HeaderCrc,
    #[error("chunk file is {actual} bytes, header describes {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("payload decoded to {actual} bytes, header says {expected}")]
    PayloadLength { expected: u32, actual: usize },
    #[error("chunk header names {found}, expected {expected}")]
    IdMismatch { expected: ChunkId, found: ChunkId },
    #[error("zstd decode failed: {0}")]
    Decompress(#[source] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub header_version: u32,
    pub header_size: u32,
    pub hash_kind: HashKind,
    pub stored_as: StoredAs,
    pub id: ChunkId,
    pub rolling_hash: u64,
    pub payload_len: u32,
    pub stored_len: u32,
}

impl ChunkHeader {
    pub fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut buf = [0u8; CHUNK_HEADER_LEN];
        buf[0..8].copy_from_slice(CHUNK_MAGIC);
        buf[8..12].copy_from_slice(&self.header_version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.header_size.to_le_bytes());
        buf[16] = self.hash_kind.tag();
        buf[17] = self.stored_as.tag();
        // 18..20 reserved
        buf[20..52].copy_from_slice(self.id.as_bytes());
        buf[52..60].copy_from_slice(&self.rolling_hash.to_le_bytes());
        buf[60..64].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[64..68].copy_from_slice(&self.stored_len.to_le_bytes());
        let mut h = Crc32::new();
        h.update(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..].copy_from_slice(&h.finalize().to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> std::result::Result<Self, ChunkFormatError> {
        if buf.len() < CHUNK_HEADER_LEN {
            return Err(ChunkFormatError::Truncated(buf.len()));
        }
        if &buf[0..8] != CHUNK_MAGIC {
            return Err(ChunkFormatError::BadMagic);
        }
        let mut h = Crc32::new();
        h.update(&buf[..CRC_OFFSET]);
        if h.finalize() != le_u32(&buf[CRC_OFFSET..]) {
            return Err(ChunkFormatError::HeaderCrc);
        }
        let header_version = le_u32(&buf[8..]);
        if header_version != CHUNK_HEADER_VERSION {
            return Err(ChunkFormatError::UnsupportedVersion(header_version));
        }
        let header_size = le_u32(&buf[12..]);
        if (header_size as usize) < CHUNK_HEADER_LEN {
            return Err(ChunkFormatError::BadHeaderSize(header_size));
        }
        let hash_kind =
            HashKind::from_tag(buf[16]).ok_or(ChunkFormatError::UnknownHashKind(buf[16]))?;
        let stored_as =
            StoredAs::from_tag(buf[17]).ok_or(ChunkFormatError::UnsupportedStorage(buf[17]))?;
        let mut id = [0u8; 32];
        id.copy_from_slice(&buf[20..52]);
        let mut hash8 = [0u8; 8];
        hash8.copy_from_slice(&buf[52..60]);
        Ok(Self {
            header_version,
            header_size,
            hash_kind,
            stored_as,
            id: ChunkId::from_bytes(id),
            rolling_hash: u64::from_le_bytes(hash8),
            payload_len: le_u32(&buf[60..]),
            stored_len: le_u32(&buf[64..]),
        })
    }

    /// Total chunk file length this header describes.
    pub fn file_len(&self) -> u64 {
        self.header_size as u64 + self.stored_len as u64
    }
}

fn le_u32(b: &[u8]) -> u32 {
    let mut four = [0u8; 4];
    four.copy_from_slice(&b[..4]);
    u32::from_le_bytes(four)
}

/// Serialize a chunk file. With `compression` set, the payload is stored as
/// zstd only when that is actually smaller than the raw bytes.
pub fn encode_chunk(
    id: ChunkId,
    rolling_hash: u64,
    payload: &[u8],
    compression: Option<i32>,
) -> Result<Vec<u8>> {
    let compressed = match compression {
        Some(level) => {
            let c = zstd::stream::encode_all(payload, level).context("zstd compress chunk")?;
            (c.len() < payload.len()).then_some(c)
        }
        None => None,
    };
    let (stored_as, stored): (StoredAs, &[u8]) = match &compressed {
        Some(c) => (StoredAs::Zstd, c),
        None => (StoredAs::Raw, payload),
    };
    let header = ChunkHeader {
        header_version: CHUNK_HEADER_VERSION,
        header_size: CHUNK_HEADER_LEN as u32,
        hash_kind: HashKind::RollingPoly64,
        stored_as,
        id,
        rolling_hash,
        payload_len: payload.len() as u32,
        stored_len: stored.len() as u32,
    };
    let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + stored.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(stored);
    Ok(out)
}

/// Decode stored bytes back to the payload, checking the declared length.
pub fn decode_payload(
    header: &ChunkHeader,
    stored: &[u8],
) -> std::result::Result<Vec<u8>, ChunkFormatError> {
    let payload = match header.stored_as {
        StoredAs::Raw => stored.to_vec(),
        StoredAs::Zstd => zstd::stream::decode_all(stored).map_err(ChunkFormatError::Decompress)?,
    };
    if payload.len() != header.payload_len as usize {
        return Err(ChunkFormatError::PayloadLength {
            expected: header.payload_len,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

/// Read just the header of a chunk file.
pub fn read_header(path: &Path) -> Result<ChunkHeader> {
    let mut f = File::open(path).with_context(|| format!("open chunk {:?}", path))?;
    let mut buf = [0u8; CHUNK_HEADER_LEN];
    let mut got = 0;
    while got < buf.len() {
        let n = f.read(&mut buf[got..]).with_context(|| format!("read chunk {:?}", path))?;
        if n == 0 {
            break;
        }
        got += n;
    }
    ChunkHeader::decode(&buf[..got]).with_context(|| format!("chunk {:?}", path))
}

/// Read and fully decode a chunk file.
pub fn read_chunk_file(path: &Path) -> Result<(ChunkHeader, Vec<u8>)> {
    let bytes = std::fs::read(path).with_context(|| format!("read chunk {:?}", path))?;
    let header = ChunkHeader::decode(&bytes).with_context(|| format!("chunk {:?}", path))?;
    if header.file_len() != bytes.len() as u64 {
        return Err(ChunkFormatError::SizeMismatch {
            expected: header.file_len(),
            actual: bytes.len() as u64,
        })
        .with_context(|| format!("chunk {:?}", path));
    }
    let payload = decode_payload(&header, &bytes[header.header_size as usize..])
        .with_context(|| format!("chunk {:?}", path))?;
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rolling_hash::RollingHash;

    fn sample(payload: &[u8], compression: Option<i32>) -> Vec<u8> {
        let id = ChunkId::from_data(payload);
        encode_chunk(id, RollingHash::hash_of(payload), payload, compression).unwrap()
    }

    #[test]
    fn header_decodes_what_encode_wrote() {
        let payload = vec![7u8; 5000];
        let bytes = sample(&payload, Some(0));
        let header = ChunkHeader::decode(&bytes).unwrap();
        assert_eq!(header.stored_as, StoredAs::Zstd);
        assert_eq!(header.payload_len, 5000);
        assert_eq!(header.file_len(), bytes.len() as u64);
        let out = decode_payload(&header, &bytes[CHUNK_HEADER_LEN..]).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn incompressible_payload_is_stored_raw() {
        let payload: Vec<u8> = (0..256u32).map(|i| (i * 167 + 13) as u8).collect();
        let bytes = sample(&payload, Some(3));
        let header = ChunkHeader::decode(&bytes).unwrap();
        assert_eq!(header.stored_as, StoredAs::Raw);
        assert_eq!(&bytes[CHUNK_HEADER_LEN..], &payload[..]);
    }

    #[test]
    fn corrupt_headers_are_rejected() {
        let bytes = sample(b"hello chunk", None);

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(ChunkHeader::decode(&bad_magic), Err(ChunkFormatError::BadMagic)));

        let mut flipped = bytes.clone();
        flipped[53] ^= 0xFF;
        assert!(matches!(ChunkHeader::decode(&flipped), Err(ChunkFormatError::HeaderCrc)));

        assert!(matches!(
            ChunkHeader::decode(&bytes[..10]),
            Err(ChunkFormatError::Truncated(10))
        ));
    }

    #[test]
    fn unknown_storage_tag_is_unsupported() {
        let header = ChunkHeader::decode(&sample(b"abc", None)).unwrap();
        let mut raw = header.encode();
        raw[17] = 9;
        // re-seal the CRC so only the tag is wrong
        let mut h = Crc32::new();
        h.update(&raw[..CRC_OFFSET]);
        raw[CRC_OFFSET..].copy_from_slice(&h.finalize().to_le_bytes());
        assert!(matches!(
            ChunkHeader::decode(&raw),
            Err(ChunkFormatError::UnsupportedStorage(9))
        ));
    }
}

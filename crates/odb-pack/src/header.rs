use std::io::{self, Read};

use odb_types::{ObjectHash, ObjectType};

use crate::error::{PackError, PackResult};

/// Pack file signature.
pub const SIGNATURE: [u8; 4] = *b"PACK";

/// Pack version written by the encoder.
pub const VERSION: u32 = 2;

/// Size of the fixed pack header: signature, version, object count.
pub const HEADER_LEN: u64 = 12;

const FIRST_LENGTH_BITS: u32 = 4;
const LENGTH_BITS: u32 = 7;
const MASK_CONTINUE: u8 = 0x80;
const MASK_FIRST_LENGTH: u64 = 0x0f;
const MASK_LENGTH: u64 = 0x7f;
const MASK_TYPE: u8 = 0x70;

/// Header of one packed entry as surfaced by the scanner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Stored type: a full type or one of the two delta encodings.
    pub object_type: ObjectType,
    /// Offset of the entry's first header byte.
    pub offset: u64,
    /// Inflated body size. For deltas this is the size of the delta itself.
    pub length: u64,
    /// Offset of the first compressed body byte.
    pub content_offset: u64,
    /// Base of a hash-delta.
    pub reference: Option<ObjectHash>,
    /// Absolute base offset of an offset-delta.
    pub offset_reference: Option<u64>,
}

impl ObjectHeader {
    pub fn is_delta(&self) -> bool {
        self.object_type.is_delta()
    }
}

/// Fixed 12-byte pack header.
pub fn encode_pack_header(count: u32) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[..4].copy_from_slice(&SIGNATURE);
    out[4..8].copy_from_slice(&VERSION.to_be_bytes());
    out[8..].copy_from_slice(&count.to_be_bytes());
    out
}

/// Parse the fixed pack header, returning (version, object count).
pub fn decode_pack_header(raw: &[u8; 12]) -> PackResult<(u32, u32)> {
    let mut signature = [0u8; 4];
    signature.copy_from_slice(&raw[..4]);
    if signature != SIGNATURE {
        return Err(PackError::InvalidSignature(signature));
    }
    let version = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    if version != 2 && version != 3 {
        return Err(PackError::UnsupportedVersion(version));
    }
    let count = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);
    Ok((version, count))
}

/// Entry head: 3-bit type plus the size, four bits in the first byte and
/// seven per continuation byte after that.
pub fn encode_entry_head(buf: &mut Vec<u8>, object_type: ObjectType, size: u64) {
    let mut size = size;
    let mut c = (object_type.pack_code() << FIRST_LENGTH_BITS) | (size & MASK_FIRST_LENGTH) as u8;
    size >>= FIRST_LENGTH_BITS;
    while size != 0 {
        buf.push(c | MASK_CONTINUE);
        c = (size & MASK_LENGTH) as u8;
        size >>= LENGTH_BITS;
    }
    buf.push(c);
}

/// Inverse of [`encode_entry_head`]. Returns (type code, size).
pub fn decode_entry_head(reader: &mut impl Read) -> io::Result<(u8, u64)> {
    let mut byte = read_byte(reader)?;
    let code = (byte & MASK_TYPE) >> FIRST_LENGTH_BITS;
    let mut size = (byte as u64) & MASK_FIRST_LENGTH;
    let mut shift = FIRST_LENGTH_BITS;
    while byte & MASK_CONTINUE != 0 {
        if shift >= 64 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "entry size overflow"));
        }
        byte = read_byte(reader)?;
        size |= ((byte as u64) & MASK_LENGTH) << shift;
        shift += LENGTH_BITS;
    }
    Ok((code, size))
}

/// Offset-delta distance: big-endian 7-bit groups where every continuation
/// adds one before shifting, so no value has two encodings.
pub fn encode_ofs(buf: &mut Vec<u8>, value: u64) {
    let mut value = value;
    let mut tmp = [0u8; 10];
    let mut pos = tmp.len() - 1;
    tmp[pos] = (value & MASK_LENGTH) as u8;
    value >>= LENGTH_BITS;
    while value != 0 {
        value -= 1;
        pos -= 1;
        tmp[pos] = MASK_CONTINUE | (value & MASK_LENGTH) as u8;
        value >>= LENGTH_BITS;
    }
    buf.extend_from_slice(&tmp[pos..]);
}

/// Inverse of [`encode_ofs`].
pub fn decode_ofs(reader: &mut impl Read) -> io::Result<u64> {
    let mut byte = read_byte(reader)?;
    let mut value = (byte as u64) & MASK_LENGTH;
    while byte & MASK_CONTINUE != 0 {
        if value > (u64::MAX >> LENGTH_BITS) - 1 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "offset overflow"));
        }
        byte = read_byte(reader)?;
        value = ((value + 1) << LENGTH_BITS) | ((byte as u64) & MASK_LENGTH);
    }
    Ok(value)
}

/// Little-endian base-128 varint used inside delta bodies.
pub(crate) fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a delta varint. Returns (value, bytes_consumed).
pub(crate) fn decode_varint(data: &[u8]) -> PackResult<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        value |= ((byte & 0x7F) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        if shift >= 64 {
            return Err(PackError::InvalidDelta("varint overflow".into()));
        }
    }
    Err(PackError::InvalidDelta("truncated varint".into()))
}

fn read_byte(reader: &mut impl Read) -> io::Result<u8> {
    let mut b = [0u8; 1];
    reader.read_exact(&mut b)?;
    Ok(b[0])
}

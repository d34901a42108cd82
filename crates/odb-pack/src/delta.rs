//! Delta bodies: a source size, a target size, then a stream of copy and
//! insert instructions replayed against the base.

use crate::error::{PackError, PackResult};
use crate::header::{decode_varint, encode_varint};

const COPY: u8 = 0x80;
const MAX_INSERT: usize = 0x7f;
const MAX_COPY: usize = 0x10000;

/// Source and target sizes from the front of a delta body.
pub fn delta_sizes(delta: &[u8]) -> PackResult<(u64, u64)> {
    let (source, used) = decode_varint(delta)?;
    let (target, _) = decode_varint(&delta[used..])?;
    Ok((source, target))
}

/// Reconstruct the target by replaying `delta` against `base`.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> PackResult<Vec<u8>> {
    let (source_size, mut pos) = decode_varint(delta)?;
    if source_size != base.len() as u64 {
        return Err(PackError::InvalidDelta(format!(
            "base is {} bytes, delta expects {source_size}",
            base.len()
        )));
    }
    let (target_size, used) = decode_varint(&delta[pos..])?;
    pos += used;

    let mut out = Vec::with_capacity(usize::try_from(target_size).unwrap_or(usize::MAX).min(1 << 24));
    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;
        if cmd & COPY != 0 {
            let mut offset = 0usize;
            let mut size = 0usize;
            for i in 0..4 {
                if cmd & (1 << i) != 0 {
                    let b = *delta.get(pos).ok_or_else(truncated)?;
                    offset |= (b as usize) << (8 * i);
                    pos += 1;
                }
            }
            for i in 0..3 {
                if cmd & (1 << (4 + i)) != 0 {
                    let b = *delta.get(pos).ok_or_else(truncated)?;
                    size |= (b as usize) << (8 * i);
                    pos += 1;
                }
            }
            if size == 0 {
                size = MAX_COPY;
            }
            let end = offset
                .checked_add(size)
                .filter(|&end| end <= base.len())
                .ok_or_else(|| {
                    PackError::InvalidDelta(format!(
                        "copy {offset}+{size} outside base of {} bytes",
                        base.len()
                    ))
                })?;
            out.extend_from_slice(&base[offset..end]);
        } else if cmd != 0 {
            let len = cmd as usize;
            let data = delta.get(pos..pos + len).ok_or_else(truncated)?;
            out.extend_from_slice(data);
            pos += len;
        } else {
            return Err(PackError::InvalidDelta("reserved opcode 0".into()));
        }
    }

    if out.len() as u64 != target_size {
        return Err(PackError::InvalidDelta(format!(
            "produced {} bytes, delta declares {target_size}",
            out.len()
        )));
    }
    Ok(out)
}

fn truncated() -> PackError {
    PackError::InvalidDelta("truncated instruction".into())
}

/// Encode `target` against `base`: copy the shared prefix and suffix,
/// insert whatever differs in between.
pub fn encode_delta(base: &[u8], target: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    encode_varint(&mut out, base.len() as u64);
    encode_varint(&mut out, target.len() as u64);

    let prefix = base
        .iter()
        .zip(target)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = base[prefix..]
        .iter()
        .rev()
        .zip(target[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    push_copy(&mut out, 0, prefix);
    push_insert(&mut out, &target[prefix..target.len() - suffix]);
    push_copy(&mut out, base.len() - suffix, suffix);
    out
}

fn push_copy(out: &mut Vec<u8>, mut offset: usize, mut len: usize) {
    while len > 0 {
        let chunk = len.min(MAX_COPY);
        let cmd_at = out.len();
        out.push(COPY);
        let mut cmd = COPY;
        for i in 0..4 {
            let b = (offset >> (8 * i)) as u8;
            if b != 0 {
                cmd |= 1 << i;
                out.push(b);
            }
        }
        // A full 64 KiB copy is encoded with no size bytes at all.
        if chunk != MAX_COPY {
            for i in 0..3 {
                let b = (chunk >> (8 * i)) as u8;
                if b != 0 {
                    cmd |= 1 << (4 + i);
                    out.push(b);
                }
            }
        }
        out[cmd_at] = cmd;
        offset += chunk;
        len -= chunk;
    }
}

fn push_insert(out: &mut Vec<u8>, data: &[u8]) {
    for chunk in data.chunks(MAX_INSERT) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn apply_copy_and_insert() {
        let base = b"hello world";
        // sizes 11 -> 10, copy 0..6, insert "rust", nothing else.
        let delta = [11, 10, 0x90, 6, 4, b'r', b'u', b's', b't'];
        assert_eq!(apply_delta(base, &delta).unwrap(), b"hello rust");
    }

    #[test]
    fn apply_rejects_wrong_base_size() {
        let delta = encode_delta(b"abc", b"abd");
        assert!(matches!(
            apply_delta(b"abcd", &delta),
            Err(PackError::InvalidDelta(_))
        ));
    }

    #[test]
    fn apply_rejects_copy_past_base() {
        // copy offset 0 size 20 from a 3-byte base
        let delta = [3, 20, 0x90, 20];
        assert!(apply_delta(b"abc", &delta).is_err());
    }

    #[test]
    fn apply_rejects_truncated_insert() {
        let delta = [0, 4, 4, b'a'];
        assert!(apply_delta(b"", &delta).is_err());
    }

    #[test]
    fn apply_rejects_opcode_zero() {
        let delta = [0, 0, 0];
        assert!(apply_delta(b"", &delta).is_err());
    }

    #[test]
    fn apply_rejects_huge_declared_target() {
        let delta = [0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f];
        assert!(matches!(
            apply_delta(b"", &delta),
            Err(PackError::InvalidDelta(_))
        ));
    }

    #[test]
    fn sizes_are_readable_up_front() {
        let delta = encode_delta(&[7u8; 300], &[7u8; 200]);
        assert_eq!(delta_sizes(&delta).unwrap(), (300, 200));
    }

    #[test]
    fn large_copies_are_chunked() {
        let base = vec![1u8; MAX_COPY * 2 + 5];
        let mut target = base.clone();
        target.push(9);
        let delta = encode_delta(&base, &target);
        assert!(delta.len() < 32);
        assert_eq!(apply_delta(&base, &delta).unwrap(), target);
    }

    proptest! {
        #[test]
        fn encode_then_apply(base in prop::collection::vec(any::<u8>(), 0..600), target in prop::collection::vec(any::<u8>(), 0..600)) {
            let delta = encode_delta(&base, &target);
            prop_assert_eq!(apply_delta(&base, &delta).unwrap(), target);
        }
    }
}

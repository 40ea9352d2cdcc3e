//! Binary deltas between two versions of a file.
//!
//! The engine only needs `diff` and `apply`; [`SpliceDelta`] is the default
//! codec. Byte range edits change one contiguous region, so a delta that keeps
//! the common prefix and suffix and stores the middle is compact for them.

use crate::error::EngineError;
use anyhow::Result;

const MAGIC: &[u8; 4] = b"MWD1";
const HEADER_LEN: usize = 4 + 8 * 3 + 32;

pub trait PatchCodec: Send + Sync {
    fn diff(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>>;
    fn apply(&self, base: &[u8], patch: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SpliceDelta;

impl PatchCodec for SpliceDelta {
    fn diff(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>> {
        let prefix = old
            .iter()
            .zip(new.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = old.len().min(new.len()) - prefix;
        let suffix = old
            .iter()
            .rev()
            .zip(new.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();
        let middle = &new[prefix..new.len() - suffix];

        let mut patch = Vec::with_capacity(HEADER_LEN + middle.len());
        patch.extend_from_slice(MAGIC);
        patch.extend_from_slice(&(old.len() as u64).to_le_bytes());
        patch.extend_from_slice(&(prefix as u64).to_le_bytes());
        patch.extend_from_slice(&(suffix as u64).to_le_bytes());
        patch.extend_from_slice(blake3::hash(old).as_bytes());
        patch.extend_from_slice(middle);
        Ok(patch)
    }

    fn apply(&self, base: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
        if patch.len() < HEADER_LEN || &patch[..4] != MAGIC {
            return Err(EngineError::PatchMismatch("unrecognized patch header".to_string()).into());
        }
        let base_len = read_u64(&patch[4..12]) as usize;
        let prefix = read_u64(&patch[12..20]) as usize;
        let suffix = read_u64(&patch[20..28]) as usize;
        let expected_hash = &patch[28..60];

        if base.len() != base_len {
            return Err(EngineError::PatchMismatch(format!(
                "base size mismatch: expected {base_len}, got {}",
                base.len()
            ))
            .into());
        }
        if blake3::hash(base).as_bytes() != expected_hash {
            return Err(EngineError::PatchMismatch("base hash mismatch".to_string()).into());
        }
        if prefix + suffix > base_len {
            return Err(EngineError::PatchMismatch("corrupt patch ranges".to_string()).into());
        }

        let middle = &patch[HEADER_LEN..];
        let mut out = Vec::with_capacity(prefix + middle.len() + suffix);
        out.extend_from_slice(&base[..prefix]);
        out.extend_from_slice(middle);
        out.extend_from_slice(&base[base_len - suffix..]);
        Ok(out)
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

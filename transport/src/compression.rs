//! Command compression: a single pass LZ4 block, prefixed with the uncompressed length
//!  (u32 LE) so the receiver can check the size before allocating anything.

use crate::error::PacketProcessError;
use crate::safe_converter::SafeCast;
use anyhow::Context;
use tracing::trace;

const SIZE_PREFIX_LEN: usize = 4;

pub fn compress(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let compressed = lz4::block::compress(data, None, true)
        .context("lz4 compression failed")?;
    trace!("compressed {} bytes to {}", data.len(), compressed.len());
    Ok(compressed)
}

/// compresses `data` if that actually makes it smaller, returning `None` otherwise
pub fn compress_if_smaller(data: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
    let compressed = compress(data)?;
    if compressed.len() < data.len() {
        Ok(Some(compressed))
    }
    else {
        Ok(None)
    }
}

/// the uncompressed size announced by a compressed buffer
pub fn decompressed_size(data: &[u8]) -> Option<usize> {
    let prefix: [u8; SIZE_PREFIX_LEN] = data.get(..SIZE_PREFIX_LEN)?.try_into().ok()?;
    Some(u32::from_le_bytes(prefix).safe_cast())
}

pub fn decompress(data: &[u8], max_size: usize) -> Result<Vec<u8>, PacketProcessError> {
    let size = decompressed_size(data)
        .ok_or(PacketProcessError::CommandDecompressFailed)?;
    if size > max_size {
        return Err(PacketProcessError::CommandTooLarge(size));
    }

    let result = lz4::block::decompress(data, None)
        .map_err(|_| PacketProcessError::CommandDecompressFailed)?;
    if result.len() != size {
        return Err(PacketProcessError::CommandDecompressFailed);
    }
    Ok(result)
}

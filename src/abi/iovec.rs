use super::{read_u32, slice, slice_mut, MarshalError};

/// A `(pointer, length)` pair describing one buffer in linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    pub ptr: u32,
    pub len: u32,
}

impl IoVec {
    /// Size of an encoded iovec: two little-endian u32s.
    pub const SIZE: u32 = 8;

    pub fn view<'m>(&self, memory: &'m [u8]) -> Result<&'m [u8], MarshalError> {
        slice(memory, self.ptr, self.len)
    }

    pub fn view_mut<'m>(&self, memory: &'m mut [u8]) -> Result<&'m mut [u8], MarshalError> {
        slice_mut(memory, self.ptr, self.len)
    }
}

/// Decode `count` iovecs starting at `addr`.
pub fn read_iovecs(memory: &[u8], addr: u32, count: u32) -> Result<Vec<IoVec>, MarshalError> {
    // The array itself must be in bounds before anything is decoded.
    let total = count.checked_mul(IoVec::SIZE).ok_or(MarshalError::OutOfBounds {
        addr: addr as u64,
        len: count as u64 * IoVec::SIZE as u64,
        size: memory.len(),
    })?;
    slice(memory, addr, total)?;

    (0..count)
        .map(|i| -> Result<IoVec, MarshalError> {
            let at = addr + i * IoVec::SIZE;
            Ok(IoVec {
                ptr: read_u32(memory, at)?,
                len: read_u32(memory, at + 4)?,
            })
        })
        .collect()
}

/// Borrow every iovec as a byte view, in order.
pub fn gather<'m>(memory: &'m [u8], iovs: &[IoVec]) -> Result<Vec<&'m [u8]>, MarshalError> {
    iovs.iter().map(|iov| iov.view(memory)).collect()
}

/// Copy `bytes` into the iovecs left to right; returns how many were placed.
pub fn scatter(memory: &mut [u8], iovs: &[IoVec], bytes: &[u8]) -> Result<usize, MarshalError> {
    let mut offset = 0;
    for iov in iovs {
        if offset == bytes.len() {
            break;
        }
        let dst = iov.view_mut(memory)?;
        let n = dst.len().min(bytes.len() - offset);
        dst[..n].copy_from_slice(&bytes[offset..offset + n]);
        offset += n;
    }
    Ok(offset)
}

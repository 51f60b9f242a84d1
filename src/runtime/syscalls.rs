//! Host-implemented preview1 calls
//!
//! Every function here has the shape of a dynamically typed import: it gets
//! the caller and the raw arguments and answers with a [`Call`]. Guest memory
//! is looked up again on each call, and again inside every resume closure,
//! since the guest may grow it while a call is suspended.

use super::{ProcessExit, WasiError, WasiState};
use crate::abi::{
    self, arg_i32, arg_u32, gather, read_iovecs, scatter, Clock, Errno, IoVec, MarshalError,
    CLOCK_RESOLUTION_NS,
};
use crate::asyncify::{Call, Resume, Suspension};
use crate::streams::Transfer;
use rand::rngs::OsRng;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};
use wasmtime::{Caller, StoreContextMut, Val};

pub(crate) type SyscallResult = wasmtime::Result<Call<WasiState>>;

fn ready(errno: Errno) -> SyscallResult {
    Ok(Call::Ready(errno.raw()))
}

fn errno_of(result: Result<(), MarshalError>) -> Errno {
    match result {
        Ok(()) => Errno::Success,
        Err(e) => e.into(),
    }
}

/// Guest memory together with the store data, borrowed side by side.
fn guest<'a>(caller: &'a mut Caller<'_, WasiState>) -> wasmtime::Result<(&'a mut [u8], &'a mut WasiState)> {
    let memory = caller.data().memory.ok_or(WasiError::MemoryUnbound)?;
    Ok(memory.data_and_store_mut(caller))
}

fn resumed_guest<'a>(
    store: &'a mut StoreContextMut<'_, WasiState>,
) -> wasmtime::Result<&'a mut [u8]> {
    let memory = store.data().memory.ok_or(WasiError::MemoryUnbound)?;
    Ok(memory.data_mut(store))
}

// ============================================================================
// Arguments and environment
// ============================================================================

/// Lay out `values` as NUL-terminated strings from `buf`, with a pointer to
/// each one in the array at `ptrs`.
fn write_strings(memory: &mut [u8], values: &[String], ptrs: u32, buf: u32) -> Result<(), MarshalError> {
    let (mut ptr, mut at) = (ptrs, buf);
    for value in values {
        abi::write_u32(memory, ptr, at)?;
        let len = value.len() as u32 + 1;
        let dst = abi::slice_mut(memory, at, len)?;
        dst[..value.len()].copy_from_slice(value.as_bytes());
        dst[value.len()] = 0;
        ptr = ptr.wrapping_add(4);
        at = at.wrapping_add(len);
    }
    Ok(())
}

/// Count and total NUL-terminated size of `values`.
fn write_sizes(memory: &mut [u8], values: &[String], count_ptr: u32, size_ptr: u32) -> Result<(), MarshalError> {
    let size = values
        .iter()
        .fold(0u32, |total, value| total.saturating_add(value.len() as u32 + 1));
    abi::write_u32(memory, count_ptr, values.len() as u32)?;
    abi::write_u32(memory, size_ptr, size)
}

pub(crate) fn args_get(caller: &mut Caller<'_, WasiState>, params: &[Val]) -> SyscallResult {
    let (argv, argv_buf) = (arg_u32(params, 0)?, arg_u32(params, 1)?);
    let (memory, state) = guest(caller)?;
    ready(errno_of(write_strings(memory, &state.args, argv, argv_buf)))
}

pub(crate) fn args_sizes_get(caller: &mut Caller<'_, WasiState>, params: &[Val]) -> SyscallResult {
    let (count, size) = (arg_u32(params, 0)?, arg_u32(params, 1)?);
    let (memory, state) = guest(caller)?;
    ready(errno_of(write_sizes(memory, &state.args, count, size)))
}

pub(crate) fn environ_get(caller: &mut Caller<'_, WasiState>, params: &[Val]) -> SyscallResult {
    let (environ, environ_buf) = (arg_u32(params, 0)?, arg_u32(params, 1)?);
    let (memory, state) = guest(caller)?;
    ready(errno_of(write_strings(memory, &state.env, environ, environ_buf)))
}

pub(crate) fn environ_sizes_get(caller: &mut Caller<'_, WasiState>, params: &[Val]) -> SyscallResult {
    let (count, size) = (arg_u32(params, 0)?, arg_u32(params, 1)?);
    let (memory, state) = guest(caller)?;
    ready(errno_of(write_sizes(memory, &state.env, count, size)))
}

// ============================================================================
// Clocks
// ============================================================================

fn now_ns() -> u64 {
    // Millisecond granularity, reported in nanoseconds.
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    ms.saturating_mul(1_000_000)
}

pub(crate) fn clock_res_get(caller: &mut Caller<'_, WasiState>, params: &[Val]) -> SyscallResult {
    let (id, retptr) = (arg_i32(params, 0)?, arg_u32(params, 1)?);
    if Clock::from_raw(id).is_none() {
        return ready(Errno::Inval);
    }
    let (memory, _) = guest(caller)?;
    ready(errno_of(abi::write_u64(memory, retptr, CLOCK_RESOLUTION_NS)))
}

pub(crate) fn clock_time_get(caller: &mut Caller<'_, WasiState>, params: &[Val]) -> SyscallResult {
    // params[1] is the requested precision, which has no effect here.
    let (id, retptr) = (arg_i32(params, 0)?, arg_u32(params, 2)?);
    if Clock::from_raw(id).is_none() {
        return ready(Errno::Inval);
    }
    let (memory, _) = guest(caller)?;
    ready(errno_of(abi::write_u64(memory, retptr, now_ns())))
}

// ============================================================================
// Stdio
// ============================================================================

fn finish_read(memory: &mut [u8], iovs: &[IoVec], bytes: &[u8], retptr: u32) -> Errno {
    let placed = scatter(memory, iovs, bytes).and_then(|n| abi::write_u32(memory, retptr, n as u32));
    errno_of(placed)
}

/// `fd_read` on descriptors 0..3.
pub(crate) fn fd_read(caller: &mut Caller<'_, WasiState>, params: &[Val]) -> SyscallResult {
    let fd = arg_u32(params, 0)? as usize;
    let (iovs_ptr, iovs_len, retptr) = (arg_u32(params, 1)?, arg_u32(params, 2)?, arg_u32(params, 3)?);

    let (memory, state) = guest(caller)?;
    let iovs = match read_iovecs(memory, iovs_ptr, iovs_len) {
        Ok(iovs) => iovs,
        Err(e) => return ready(e.into()),
    };
    let lens: Vec<u32> = iovs.iter().map(|iov| iov.len).collect();
    let Some(stream) = state.streams.get_mut(fd) else {
        return ready(Errno::Badf);
    };

    match stream.readv(&lens)? {
        Transfer::Ready(bytes) => ready(finish_read(memory, &iovs, &bytes, retptr)),
        Transfer::Pending(read) => Ok(Call::Suspend(Suspension::new(async move {
            let bytes = read.await?;
            let resume: Resume<WasiState> = Box::new(move |mut store: StoreContextMut<'_, WasiState>| {
                let memory = resumed_guest(&mut store)?;
                Ok(finish_read(memory, &iovs, &bytes, retptr).raw())
            });
            Ok(resume)
        }))),
    }
}

/// `fd_write` on descriptors 0..3.
pub(crate) fn fd_write(caller: &mut Caller<'_, WasiState>, params: &[Val]) -> SyscallResult {
    let fd = arg_u32(params, 0)? as usize;
    let (iovs_ptr, iovs_len, retptr) = (arg_u32(params, 1)?, arg_u32(params, 2)?, arg_u32(params, 3)?);

    let (memory, state) = guest(caller)?;
    let iovs = match read_iovecs(memory, iovs_ptr, iovs_len) {
        Ok(iovs) => iovs,
        Err(e) => return ready(e.into()),
    };
    let views = match gather(memory, &iovs) {
        Ok(views) => views,
        Err(e) => return ready(e.into()),
    };
    let Some(stream) = state.streams.get_mut(fd) else {
        return ready(Errno::Badf);
    };

    match stream.writev(&views)? {
        Transfer::Ready(written) => ready(errno_of(abi::write_u32(memory, retptr, written))),
        Transfer::Pending(write) => Ok(Call::Suspend(Suspension::new(async move {
            let written = write.await?;
            let resume: Resume<WasiState> = Box::new(move |mut store: StoreContextMut<'_, WasiState>| {
                let memory = resumed_guest(&mut store)?;
                Ok(errno_of(abi::write_u32(memory, retptr, written)).raw())
            });
            Ok(resume)
        }))),
    }
}

// ============================================================================
// Process, randomness, scheduling
// ============================================================================

pub(crate) fn proc_exit(_caller: &mut Caller<'_, WasiState>, params: &[Val]) -> SyscallResult {
    let code = arg_i32(params, 0)?;
    tracing::debug!(code, "proc_exit");
    Err(ProcessExit { code }.into())
}

pub(crate) fn random_get(caller: &mut Caller<'_, WasiState>, params: &[Val]) -> SyscallResult {
    let (buf, len) = (arg_u32(params, 0)?, arg_u32(params, 1)?);
    let (memory, _) = guest(caller)?;
    let dst = match abi::slice_mut(memory, buf, len) {
        Ok(dst) => dst,
        Err(e) => return ready(e.into()),
    };
    match OsRng.try_fill_bytes(dst) {
        Ok(()) => ready(Errno::Success),
        Err(e) => {
            tracing::warn!(error = %e, "random_get: entropy source failed");
            ready(Errno::Io)
        }
    }
}

pub(crate) fn sched_yield(_caller: &mut Caller<'_, WasiState>, _params: &[Val]) -> SyscallResult {
    ready(Errno::Success)
}

/// poll_oneoff, proc_raise and the sock_* family.
pub(crate) fn unsupported(_caller: &mut Caller<'_, WasiState>, _params: &[Val]) -> SyscallResult {
    ready(Errno::NoSys)
}

//! ABI: snapshot_preview1 constants and marshaling
//!
//! Result codes, clock identifiers and the canonical signatures of every
//! import in the `wasi_snapshot_preview1` namespace, plus helpers for
//! reading and writing little-endian values inside a linear memory.

mod iovec;

pub use iovec::{gather, read_iovecs, scatter, IoVec};

use thiserror::Error;

/// Import namespace of the preview1 ABI.
pub const NAMESPACE: &str = "wasi_snapshot_preview1";

/// Result codes, numbered as in the published preview1 `errno` table.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Errno {
    Success = 0,
    TooBig = 1,
    Access = 2,
    AddrInUse = 3,
    AddrNotAvail = 4,
    AfNoSupport = 5,
    Again = 6,
    Already = 7,
    Badf = 8,
    BadMsg = 9,
    Busy = 10,
    Canceled = 11,
    Child = 12,
    ConnAborted = 13,
    ConnRefused = 14,
    ConnReset = 15,
    Deadlk = 16,
    DestAddrReq = 17,
    Dom = 18,
    Dquot = 19,
    Exist = 20,
    Fault = 21,
    Fbig = 22,
    HostUnreach = 23,
    Idrm = 24,
    Ilseq = 25,
    InProgress = 26,
    Intr = 27,
    Inval = 28,
    Io = 29,
    IsConn = 30,
    IsDir = 31,
    Loop = 32,
    Mfile = 33,
    Mlink = 34,
    MsgSize = 35,
    Multihop = 36,
    NameTooLong = 37,
    NetDown = 38,
    NetReset = 39,
    NetUnreach = 40,
    Nfile = 41,
    NoBufs = 42,
    NoDev = 43,
    NoEnt = 44,
    NoExec = 45,
    NoLck = 46,
    NoLink = 47,
    NoMem = 48,
    NoMsg = 49,
    NoProtoOpt = 50,
    NoSpc = 51,
    NoSys = 52,
    NotConn = 53,
    NotDir = 54,
    NotEmpty = 55,
    NotRecoverable = 56,
    NotSock = 57,
    NotSup = 58,
    NotTy = 59,
    Nxio = 60,
    Overflow = 61,
    OwnerDead = 62,
    Perm = 63,
    Pipe = 64,
    Proto = 65,
    ProtoNoSupport = 66,
    ProtoType = 67,
    Range = 68,
    Rofs = 69,
    Spipe = 70,
    Srch = 71,
    Stale = 72,
    TimedOut = 73,
    TxtBsy = 74,
    Xdev = 75,
    NotCapable = 76,
}

impl Errno {
    /// The value handed back to the guest as an import result.
    pub fn raw(self) -> i32 {
        self as u16 as i32
    }
}

impl From<MarshalError> for Errno {
    fn from(_: MarshalError) -> Self {
        Errno::Fault
    }
}

/// Clock identifiers understood by `clock_res_get` and `clock_time_get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    Realtime = 0,
    Monotonic = 1,
    ProcessCputime = 2,
    ThreadCputime = 3,
}

impl Clock {
    pub fn from_raw(id: i32) -> Option<Self> {
        match id {
            0 => Some(Self::Realtime),
            1 => Some(Self::Monotonic),
            2 => Some(Self::ProcessCputime),
            3 => Some(Self::ThreadCputime),
            _ => None,
        }
    }
}

/// Resolution reported for every supported clock, in nanoseconds.
pub const CLOCK_RESOLUTION_NS: u64 = 1_000_000;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshalError {
    #[error("Out of bounds: {len} bytes at {addr:#x} (memory is {size} bytes)")]
    OutOfBounds { addr: u64, len: u64, size: usize },

    #[error("Argument {index} is not an {expected}")]
    Argument { index: usize, expected: &'static str },
}

/// Read an `i32` argument of a dynamically typed import.
pub fn arg_i32(params: &[wasmtime::Val], index: usize) -> Result<i32, MarshalError> {
    params
        .get(index)
        .and_then(wasmtime::Val::i32)
        .ok_or(MarshalError::Argument {
            index,
            expected: "i32",
        })
}

/// Pointers and lengths arrive as `i32` but are unsigned.
pub fn arg_u32(params: &[wasmtime::Val], index: usize) -> Result<u32, MarshalError> {
    arg_i32(params, index).map(|value| value as u32)
}

pub fn arg_i64(params: &[wasmtime::Val], index: usize) -> Result<i64, MarshalError> {
    params
        .get(index)
        .and_then(wasmtime::Val::i64)
        .ok_or(MarshalError::Argument {
            index,
            expected: "i64",
        })
}

/// Borrow `len` bytes at `addr`, bounds-checked.
pub fn slice(memory: &[u8], addr: u32, len: u32) -> Result<&[u8], MarshalError> {
    let range = range(memory.len(), addr, len)?;
    Ok(&memory[range])
}

/// Mutably borrow `len` bytes at `addr`, bounds-checked.
pub fn slice_mut(memory: &mut [u8], addr: u32, len: u32) -> Result<&mut [u8], MarshalError> {
    let range = range(memory.len(), addr, len)?;
    Ok(&mut memory[range])
}

fn range(size: usize, addr: u32, len: u32) -> Result<std::ops::Range<usize>, MarshalError> {
    let start = addr as usize;
    match start.checked_add(len as usize) {
        Some(end) if end <= size => Ok(start..end),
        _ => Err(MarshalError::OutOfBounds {
            addr: addr as u64,
            len: len as u64,
            size,
        }),
    }
}

pub fn read_u32(memory: &[u8], addr: u32) -> Result<u32, MarshalError> {
    let bytes = slice(memory, addr, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn write_u32(memory: &mut [u8], addr: u32, value: u32) -> Result<(), MarshalError> {
    slice_mut(memory, addr, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn write_u64(memory: &mut [u8], addr: u32, value: u64) -> Result<(), MarshalError> {
    slice_mut(memory, addr, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

// ============================================================================
// Import signatures
// ============================================================================

/// Core value types appearing in preview1 signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ty {
    I32,
    I64,
}

impl From<Ty> for wasmtime::ValType {
    fn from(ty: Ty) -> Self {
        match ty {
            Ty::I32 => wasmtime::ValType::I32,
            Ty::I64 => wasmtime::ValType::I64,
        }
    }
}

/// Where an import is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Implemented by the host façade itself.
    Host,
    /// Forwarded unmodified to the filesystem module's export of the same name.
    Filesystem,
}

#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub name: &'static str,
    pub params: &'static [Ty],
    pub result: bool,
    pub route: Route,
}

const fn host(name: &'static str, params: &'static [Ty]) -> Signature {
    Signature {
        name,
        params,
        result: true,
        route: Route::Host,
    }
}

const fn fs(name: &'static str, params: &'static [Ty]) -> Signature {
    Signature {
        name,
        params,
        result: true,
        route: Route::Filesystem,
    }
}

use Ty::{I32, I64};

/// The full import surface, in the order it is installed.
pub const SIGNATURES: &[Signature] = &[
    host("args_get", &[I32, I32]),
    host("args_sizes_get", &[I32, I32]),
    host("clock_res_get", &[I32, I32]),
    host("clock_time_get", &[I32, I64, I32]),
    host("environ_get", &[I32, I32]),
    host("environ_sizes_get", &[I32, I32]),
    fs("fd_advise", &[I32, I64, I64, I32]),
    fs("fd_allocate", &[I32, I64, I64]),
    fs("fd_close", &[I32]),
    fs("fd_datasync", &[I32]),
    fs("fd_fdstat_get", &[I32, I32]),
    fs("fd_fdstat_set_flags", &[I32, I32]),
    fs("fd_fdstat_set_rights", &[I32, I64, I64]),
    fs("fd_filestat_get", &[I32, I32]),
    fs("fd_filestat_set_size", &[I32, I64]),
    fs("fd_filestat_set_times", &[I32, I64, I64, I32]),
    fs("fd_pread", &[I32, I32, I32, I64, I32]),
    fs("fd_prestat_dir_name", &[I32, I32, I32]),
    fs("fd_prestat_get", &[I32, I32]),
    fs("fd_pwrite", &[I32, I32, I32, I64, I32]),
    host("fd_read", &[I32, I32, I32, I32]),
    fs("fd_readdir", &[I32, I32, I32, I64, I32]),
    fs("fd_renumber", &[I32, I32]),
    fs("fd_seek", &[I32, I64, I32, I32]),
    fs("fd_sync", &[I32]),
    fs("fd_tell", &[I32, I32]),
    host("fd_write", &[I32, I32, I32, I32]),
    fs("path_create_directory", &[I32, I32, I32]),
    fs("path_filestat_get", &[I32, I32, I32, I32, I32]),
    fs("path_filestat_set_times", &[I32, I32, I32, I32, I64, I64, I32]),
    fs("path_link", &[I32, I32, I32, I32, I32, I32, I32]),
    fs("path_open", &[I32, I32, I32, I32, I32, I64, I64, I32, I32]),
    fs("path_readlink", &[I32, I32, I32, I32, I32, I32]),
    fs("path_remove_directory", &[I32, I32, I32]),
    fs("path_rename", &[I32, I32, I32, I32, I32, I32]),
    fs("path_symlink", &[I32, I32, I32, I32, I32]),
    fs("path_unlink_file", &[I32, I32, I32]),
    host("poll_oneoff", &[I32, I32, I32, I32]),
    Signature {
        name: "proc_exit",
        params: &[I32],
        result: false,
        route: Route::Host,
    },
    host("proc_raise", &[I32]),
    host("random_get", &[I32, I32]),
    host("sched_yield", &[]),
    host("sock_recv", &[I32, I32, I32, I32, I32, I32]),
    host("sock_send", &[I32, I32, I32, I32, I32]),
    host("sock_shutdown", &[I32, I32]),
];

/// Look up the canonical signature of an import.
pub fn signature(name: &str) -> Option<&'static Signature> {
    SIGNATURES.iter().find(|sig| sig.name == name)
}

impl Signature {
    pub fn func_type(&self, engine: &wasmtime::Engine) -> wasmtime::FuncType {
        let results = if self.result { vec![Ty::I32] } else { vec![] };
        wasmtime::FuncType::new(
            engine,
            self.params.iter().copied().map(wasmtime::ValType::from),
            results.into_iter().map(wasmtime::ValType::from),
        )
    }
}

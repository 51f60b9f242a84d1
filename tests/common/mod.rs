//! Shared fixtures: a stand-in filesystem module, guest builders and a
//! capturing sink.

#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use workers_wasi::abi::{signature, Route, Ty, SIGNATURES};
use workers_wasi::{Runtime, WasiError, WasiOptions};

/// Guest address of the scratch iovec array.
pub const IOV: u32 = 1024;
/// Guest address for `nwritten` / `nread` results.
pub const RET: u32 = 1100;
/// Guest address of string data.
pub const BUF: u32 = 2048;
/// Where instrumented guests record each call site's result.
pub const LOG: u32 = 4096;

// ============================================================================
// Stand-in filesystem module
// ============================================================================

/// Exports with behaviour; every other forwarded name answers ENOSYS.
///
/// - `fd_write` on any descriptor replaces the single file with the first iovec
/// - `fd_read` copies the file into the first iovec (the file starts out as
///   the JSON seed)
/// - `fd_fdstat_get(fd, ret)` stores `fd + 100` at `ret`
/// - `fd_close` raises an error trace
/// - `fd_prestat_get` answers BADF
const FS_BODY: &str = r#"
    (import "internal" "now_ms" (func $now_ms (result i64)))
    (import "internal" "trace" (func $trace (param i32 i32 i32)))
    (import "internal" "copy_in" (func $copy_in (param i32 i32 i32)))
    (import "internal" "copy_out" (func $copy_out (param i32 i32 i32)))
    (memory (export "memory") 1)
    (global $next (mut i32) (i32.const 32768))
    (global $file_len (mut i32) (i32.const 0))
    (data (i32.const 0) "boom")

    (func (export "_start") (drop (call $now_ms)))
    (func (export "tmp_alloc") (param $size i32) (result i32)
        (local $ptr i32)
        (local.set $ptr (global.get $next))
        (global.set $next (i32.add (global.get $next) (local.get $size)))
        (local.get $ptr))
    (func (export "tmp_free") (global.set $next (i32.const 32768)))
    (func (export "initialize_internal") (param $ptr i32) (param $len i32) (result i32)
        (memory.copy (i32.const 4096) (local.get $ptr) (local.get $len))
        (global.set $file_len (local.get $len))
        (i32.const 0))

    (func (export "fd_write") (param $fd i32) (param $iovs i32) (param $n i32) (param $ret i32) (result i32)
        (call $copy_in (local.get $iovs) (i32.const 64) (i32.const 8))
        (call $copy_in (i32.load (i32.const 64)) (i32.const 4096) (i32.load (i32.const 68)))
        (global.set $file_len (i32.load (i32.const 68)))
        (i32.store (i32.const 100) (global.get $file_len))
        (call $copy_out (i32.const 100) (local.get $ret) (i32.const 4))
        (i32.const 0))
    (func (export "fd_read") (param $fd i32) (param $iovs i32) (param $n i32) (param $ret i32) (result i32)
        (local $len i32)
        (call $copy_in (local.get $iovs) (i32.const 64) (i32.const 8))
        (local.set $len (i32.load (i32.const 68)))
        (if (i32.gt_u (local.get $len) (global.get $file_len))
            (then (local.set $len (global.get $file_len))))
        (call $copy_out (i32.const 4096) (i32.load (i32.const 64)) (local.get $len))
        (i32.store (i32.const 100) (local.get $len))
        (call $copy_out (i32.const 100) (local.get $ret) (i32.const 4))
        (i32.const 0))
    (func (export "fd_fdstat_get") (param $fd i32) (param $ret i32) (result i32)
        (i32.store (i32.const 100) (i32.add (local.get $fd) (i32.const 100)))
        (call $copy_out (i32.const 100) (local.get $ret) (i32.const 4))
        (i32.const 0))
    (func (export "fd_close") (param $fd i32) (result i32)
        (call $trace (i32.const 1) (i32.const 0) (i32.const 4))
        (i32.const 0))
    (func (export "fd_prestat_get") (param $fd i32) (param $ret i32) (result i32)
        (i32.const 8))
"#;

const FS_CUSTOM: &[&str] = &["fd_write", "fd_read", "fd_fdstat_get", "fd_close", "fd_prestat_get"];

fn params(tys: &[Ty]) -> String {
    tys.iter()
        .map(|ty| match ty {
            Ty::I32 => " i32",
            Ty::I64 => " i64",
        })
        .collect()
}

/// The stand-in filesystem, leaving out the exports named in `omit`.
pub fn memfs_wat_without(omit: &[&str]) -> String {
    let stubs: String = SIGNATURES
        .iter()
        .filter(|sig| sig.route == Route::Filesystem && !FS_CUSTOM.contains(&sig.name))
        .filter(|sig| !omit.contains(&sig.name))
        .map(|sig| {
            format!(
                "    (func (export \"{}\") (param{}) (result i32) (i32.const 52))\n",
                sig.name,
                params(sig.params)
            )
        })
        .collect();
    format!("(module\n{FS_BODY}\n{stubs})")
}

pub fn memfs_wat() -> String {
    memfs_wat_without(&[])
}

pub fn runtime() -> Runtime {
    let wasm = wat::parse_str(memfs_wat()).expect("parse memfs WAT");
    Runtime::new(&wasm).expect("runtime")
}

/// Compile and run a guest to completion.
pub async fn run(guest_wat: &str, options: WasiOptions) -> Result<Option<i32>, WasiError> {
    let runtime = runtime();
    let wasm = wat::parse_str(guest_wat).expect("parse guest WAT");
    let module = runtime.load_module(&wasm).expect("load guest");
    runtime.run(&module, options).await
}

// ============================================================================
// Guests
// ============================================================================

/// Import declarations for preview1 functions, each bound to `$name`.
pub fn wasi_imports(names: &[&str]) -> String {
    names
        .iter()
        .map(|name| {
            let sig = signature(name).expect("preview1 import");
            let result = if sig.result { " (result i32)" } else { "" };
            format!(
                "(import \"wasi_snapshot_preview1\" \"{name}\" (func ${name} (param{}){result}))\n",
                params(sig.params)
            )
        })
        .collect()
}

/// A data segment holding iovecs `(ptr, len)` at `addr`.
pub fn iovecs(addr: u32, iovs: &[(u32, u32)]) -> String {
    let mut bytes = String::new();
    for (ptr, len) in iovs {
        for b in ptr.to_le_bytes().iter().chain(len.to_le_bytes().iter()) {
            bytes.push_str(&format!("\\{b:02x}"));
        }
    }
    format!("(data (i32.const {addr}) \"{bytes}\")\n")
}

/// A plain guest whose `_start` runs `body`.
pub fn guest(imports: &[&str], fields: &str, body: &str) -> String {
    format!(
        r#"(module
{imports}
(memory (export "memory") 1)
{fields}
(func (export "_start") (local $r i32)
{body}))"#,
        imports = wasi_imports(imports)
    )
}

/// A guest hand-instrumented the way binaryen's asyncify would, reduced to
/// straight-line code: `sites` are i32-valued expressions run in order, each
/// result stored at `LOG + 4 * i`.
///
/// When a call leaves the guest unwinding, `_start` returns at once; when it
/// is re-entered for a rewind the completed sites are skipped, so the
/// suspended one is reached again without repeating earlier calls.
pub fn instrumented_guest(imports: &str, fields: &str, sites: &[&str]) -> String {
    let steps: String = sites
        .iter()
        .enumerate()
        .map(|(i, call)| {
            format!(
                r#"
    (if (i32.eq (global.get $site) (i32.const {i}))
        (then
            (local.set $r {call})
            (if (i32.eq (global.get $state) (i32.const 1)) (then (return)))
            (i32.store (i32.const {addr}) (local.get $r))
            (global.set $site (i32.const {next}))))"#,
                addr = LOG + 4 * i as u32,
                next = i + 1,
            )
        })
        .collect();

    format!(
        r#"(module
{imports}
(memory (export "memory") 1)
(global $state (mut i32) (i32.const 0))
(global $site (mut i32) (i32.const 0))
{fields}
(func (export "asyncify_start_unwind") (param i32) (global.set $state (i32.const 1)))
(func (export "asyncify_stop_unwind") (global.set $state (i32.const 0)))
(func (export "asyncify_start_rewind") (param i32) (global.set $state (i32.const 2)))
(func (export "asyncify_stop_rewind") (global.set $state (i32.const 0)))
(func (export "asyncify_get_state") (result i32) (global.get $state))
(func (export "_start") (local $r i32)
{steps}))"#
    )
}

/// Wrap a call with no result as an i32-valued site.
pub fn void_site(call: &str) -> String {
    format!("(block (result i32) {call} (i32.const 0))")
}

// ============================================================================
// Streams
// ============================================================================

/// A sink that records everything written and whether it was shut down.
#[derive(Clone, Default)]
pub struct Capture {
    bytes: Arc<Mutex<Vec<u8>>>,
    closed: Arc<Mutex<bool>>,
}

impl Capture {
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    pub fn sink(&self) -> workers_wasi::ByteSink {
        Box::new(self.clone())
    }
}

impl AsyncWrite for Capture {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.bytes.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        *self.closed.lock().unwrap() = true;
        Poll::Ready(Ok(()))
    }
}

pub fn source(bytes: &'static [u8]) -> workers_wasi::ByteSource {
    Box::new(bytes)
}

pub fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

pub fn le_u64(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

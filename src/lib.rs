//! Workers WASI: a `wasi_snapshot_preview1` host with an in-memory filesystem
//!
//! Runs a preview1 guest on wasmtime. Descriptor and path calls are served by
//! a separate filesystem module running in the same store; stdio is backed by
//! tokio byte streams and, for guests built with binaryen's asyncify, can
//! suspend the guest while the host waits on I/O.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Wasi (façade)                │
//! │                                              │
//! │  abi       - errno, signatures, marshaling   │
//! │  streams   - stdio adapters                  │
//! │  asyncify  - unwind / rewind bridging        │
//! │  memfs     - filesystem instance bridge      │
//! │  runtime   - import table, start, outcome    │
//! │                                              │
//! ├──────────────────────────────────────────────┤
//! │        WASM Execution (wasmtime, sync)       │
//! └──────────────────────────────────────────────┘
//! ```

pub mod abi;
pub mod asyncify;
pub mod memfs;
pub mod runtime;
pub mod streams;

pub use abi::Errno;
pub use runtime::{
    Outcome, ProcessExit, Runtime, Wasi, WasiError, WasiOptions, WasiState, UNREACHABLE_STATUS,
};
pub use streams::{ByteSink, ByteSource};

//! Import Table Registration
//!
//! Installs all of `wasi_snapshot_preview1` on a [`Linker`]. Every import is
//! defined with its canonical signature from [`crate::abi::SIGNATURES`] and
//! goes through the same wrapper, which:
//!
//! - runs the call under the asyncify bridge when streaming is enabled, or
//!   directly otherwise;
//! - logs `name(args) = result` when import tracing is turned on.
//!
//! Imports routed to the filesystem are forwarded to the export of the same
//! name on the filesystem instance, arguments untouched.

use super::syscalls::{self, SyscallResult};
use super::{LinkerError, WasiState};
use crate::abi::{self, arg_u32, Route, Signature};
use crate::asyncify::{Asyncify, Call};
use crate::memfs::MemFs;
use std::fmt::Write as _;
use wasmtime::{Caller, Engine, Func, Linker, Store, Val};

/// First descriptor not served by the stdio adapters.
const FIRST_FS_FD: u32 = 3;

/// Builder over a [`Linker`] that installs one import at a time.
pub struct ImportsBuilder<'a> {
    linker: &'a mut Linker<WasiState>,
    engine: Engine,
    asyncify: bool,
    trace: bool,
}

impl<'a> ImportsBuilder<'a> {
    pub fn new(engine: &Engine, linker: &'a mut Linker<WasiState>) -> Self {
        Self {
            linker,
            engine: engine.clone(),
            asyncify: false,
            trace: false,
        }
    }

    /// Run every import under the asyncify bridge.
    pub fn asyncify(&mut self, enabled: bool) -> &mut Self {
        self.asyncify = enabled;
        self
    }

    /// Log each import call with its arguments and result.
    pub fn trace(&mut self, enabled: bool) -> &mut Self {
        self.trace = enabled;
        self
    }

    /// Define `sig` with `handler` as its implementation.
    pub fn func<H>(&mut self, sig: &'static Signature, handler: H) -> Result<&mut Self, LinkerError>
    where
        H: Fn(&mut Caller<'_, WasiState>, &[Val]) -> SyscallResult + Send + Sync + 'static,
    {
        let (asyncify, trace) = (self.asyncify, self.trace);
        self.linker
            .func_new(
                abi::NAMESPACE,
                sig.name,
                sig.func_type(&self.engine),
                move |mut caller, params, results| {
                    let outcome = if asyncify {
                        Asyncify::wrap_import(&mut caller, |caller| handler(caller, params))
                    } else {
                        handler(&mut caller, params).and_then(Call::into_ready)
                    };

                    if trace {
                        log_call(sig.name, params, &outcome);
                    }

                    let value = outcome?;
                    if let Some(slot) = results.first_mut() {
                        *slot = Val::I32(value);
                    }
                    Ok(())
                },
            )
            .map_err(|e| LinkerError::FunctionRegistration(format!("{}: {e}", sig.name)))?;
        Ok(self)
    }

    /// Define `sig` as a pass-through to `target`.
    pub fn forward(&mut self, sig: &'static Signature, target: Func) -> Result<&mut Self, LinkerError> {
        self.func(sig, move |caller, params| call_forward(target, caller, params))
    }

    /// `fd_read` / `fd_write`: stdio descriptors are served by `stdio`, the
    /// rest by the filesystem's export.
    pub fn split_by_fd<H>(
        &mut self,
        sig: &'static Signature,
        stdio: H,
        target: Func,
    ) -> Result<&mut Self, LinkerError>
    where
        H: Fn(&mut Caller<'_, WasiState>, &[Val]) -> SyscallResult + Send + Sync + 'static,
    {
        self.func(sig, move |caller, params| {
            if arg_u32(params, 0)? < FIRST_FS_FD {
                stdio(caller, params)
            } else {
                call_forward(target, caller, params)
            }
        })
    }
}

fn call_forward(target: Func, caller: &mut Caller<'_, WasiState>, params: &[Val]) -> SyscallResult {
    let mut results = [Val::I32(0)];
    target.call(&mut *caller, params, &mut results)?;
    Ok(Call::Ready(results[0].i32().unwrap_or(0)))
}

fn log_call(name: &str, params: &[Val], outcome: &wasmtime::Result<i32>) {
    let mut args = String::new();
    for (i, param) in params.iter().enumerate() {
        if i > 0 {
            args.push_str(", ");
        }
        let _ = match param {
            Val::I32(v) => write!(args, "{v}"),
            Val::I64(v) => write!(args, "{v}"),
            other => write!(args, "{other:?}"),
        };
    }
    match outcome {
        Ok(result) => tracing::info!(target: "wasi", "{name}({args}) = {result}"),
        Err(e) => tracing::info!(target: "wasi", "{name}({args}) = Error({e})"),
    }
}

fn host_handler(name: &str) -> Option<fn(&mut Caller<'_, WasiState>, &[Val]) -> SyscallResult> {
    Some(match name {
        "args_get" => syscalls::args_get,
        "args_sizes_get" => syscalls::args_sizes_get,
        "environ_get" => syscalls::environ_get,
        "environ_sizes_get" => syscalls::environ_sizes_get,
        "clock_res_get" => syscalls::clock_res_get,
        "clock_time_get" => syscalls::clock_time_get,
        "proc_exit" => syscalls::proc_exit,
        "random_get" => syscalls::random_get,
        "sched_yield" => syscalls::sched_yield,
        "poll_oneoff" | "proc_raise" | "sock_recv" | "sock_send" | "sock_shutdown" => {
            syscalls::unsupported
        }
        _ => return None,
    })
}

/// Install the full preview1 surface.
pub(crate) fn install(
    linker: &mut Linker<WasiState>,
    store: &mut Store<WasiState>,
    memfs: &MemFs,
) -> Result<(), LinkerError> {
    let (asyncify, trace) = {
        let state = store.data();
        (state.streaming, state.trace_imports)
    };
    let engine = store.engine().clone();
    let mut builder = ImportsBuilder::new(&engine, linker);
    builder.asyncify(asyncify).trace(trace);

    for sig in abi::SIGNATURES {
        match (sig.name, sig.route) {
            ("fd_read", _) => {
                let target = memfs.export(store, sig.name)?;
                builder.split_by_fd(sig, syscalls::fd_read, target)?;
            }
            ("fd_write", _) => {
                let target = memfs.export(store, sig.name)?;
                builder.split_by_fd(sig, syscalls::fd_write, target)?;
            }
            (_, Route::Filesystem) => {
                let target = memfs.export(store, sig.name)?;
                builder.forward(sig, target)?;
            }
            (name, Route::Host) => {
                let handler = host_handler(name)
                    .ok_or_else(|| LinkerError::FunctionRegistration(format!("{name}: no handler")))?;
                builder.func(sig, handler)?;
            }
        }
    }

    tracing::debug!(imports = abi::SIGNATURES.len(), asyncify, trace, "preview1 imports installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_host_route_has_a_handler() {
        for sig in abi::SIGNATURES {
            // Split by descriptor in `install`.
            if sig.route == Route::Host && !matches!(sig.name, "fd_read" | "fd_write") {
                assert!(host_handler(sig.name).is_some(), "{} has no handler", sig.name);
            }
        }
    }

    #[test]
    fn filesystem_routes_have_no_host_handler() {
        for sig in abi::SIGNATURES.iter().filter(|s| s.route == Route::Filesystem) {
            assert!(host_handler(sig.name).is_none(), "{}", sig.name);
        }
    }
}

//! In-Memory Filesystem Bridge
//!
//! The filesystem is a separate WebAssembly module instantiated in the same
//! store as the guest. It owns its own linear memory and implements the
//! descriptor and path imports of preview1; when one of those is forwarded to
//! it, the arguments still point into *guest* memory, so the module moves
//! bytes across with the `internal.copy_in` / `internal.copy_out` imports
//! this bridge provides.
//!
//! Before the guest runs, the module is seeded with the preopened directories
//! and initial file contents as a JSON document.

use crate::abi::{self, arg_u32, Errno};
use serde::Serialize;
use std::collections::BTreeMap;
use std::mem;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use wasmtime::{
    Caller, Engine, ExternType, Func, FuncType, Instance, Linker, Memory, Module, Store,
    TypedFunc, Val, ValType,
};

/// Namespace of the imports the filesystem module expects from its host.
pub const INTERNAL: &str = "internal";

#[derive(Error, Debug)]
pub enum MemFsError {
    #[error("Filesystem module does not export {0}")]
    MissingExport(String),

    #[error("Filesystem trace: {0}")]
    Trace(String),

    #[error("Guest memory not bound to the filesystem bridge")]
    GuestMemoryUnbound,

    #[error("Scratch buffer already in use")]
    ScratchInUse,

    #[error("Filesystem initialization failed with errno {0}")]
    Initialize(i32),

    #[error("Failed to encode filesystem seed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Wasm(#[from] anyhow::Error),
}

/// Store data that hosts a filesystem bridge.
pub trait MemFsHost: 'static {
    fn bridge(&mut self) -> &mut Bridge;
}

/// The two memories the bridge copies between.
#[derive(Default)]
pub struct Bridge {
    guest: Option<Memory>,
    fs: Option<Memory>,
    scratch_live: bool,
}

impl Bridge {
    /// Bind the guest's memory; must happen before the guest runs.
    pub fn bind_guest(&mut self, memory: Memory) {
        self.guest = Some(memory);
    }

    fn memories(&self) -> Result<(Memory, Memory), MemFsError> {
        let guest = self.guest.ok_or(MemFsError::GuestMemoryUnbound)?;
        let fs = self
            .fs
            .ok_or_else(|| MemFsError::MissingExport("memory".into()))?;
        Ok((guest, fs))
    }
}

#[derive(Serialize)]
struct Seed<'a> {
    preopens: &'a [String],
    fs: &'a BTreeMap<String, String>,
}

/// A running filesystem instance.
pub struct MemFs {
    instance: Instance,
    memory: Memory,
    tmp_alloc: TypedFunc<i32, i32>,
    tmp_free: TypedFunc<(), ()>,
}

impl MemFs {
    /// Instantiate the filesystem module in `store`, run its entry point and
    /// seed it with `preopens` and `fs`.
    pub fn instantiate<T: MemFsHost>(
        store: &mut Store<T>,
        module: &Module,
        preopens: &[String],
        fs: &BTreeMap<String, String>,
    ) -> Result<Self, MemFsError> {
        let linker = link::<T>(store.engine(), module)?;
        let instance = linker.instantiate(&mut *store, module)?;

        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| MemFsError::MissingExport("memory".into()))?;
        store.data_mut().bridge().fs = Some(memory);

        let memfs = Self {
            instance,
            memory,
            tmp_alloc: typed(store, &instance, "tmp_alloc")?,
            tmp_free: typed(store, &instance, "tmp_free")?,
        };

        let start: TypedFunc<(), ()> = typed(store, &instance, "_start")?;
        start.call(&mut *store, ())?;

        memfs.initialize(store, preopens, fs)?;
        tracing::debug!(preopens = preopens.len(), files = fs.len(), "filesystem seeded");
        Ok(memfs)
    }

    fn initialize<T: MemFsHost>(
        &self,
        store: &mut Store<T>,
        preopens: &[String],
        fs: &BTreeMap<String, String>,
    ) -> Result<(), MemFsError> {
        let payload = serde_json::to_vec(&Seed { preopens, fs })?;
        let initialize: TypedFunc<(i32, i32), i32> =
            typed(store, &self.instance, "initialize_internal")?;

        let errno = self.with_scratch(store, &payload, |store, ptr, len| {
            initialize.call(store, (ptr, len))
        })?;
        if errno != Errno::Success.raw() {
            return Err(MemFsError::Initialize(errno));
        }
        Ok(())
    }

    /// Stage `bytes` in the module's scratch region for the duration of `f`.
    /// The region is released on every path.
    pub fn with_scratch<T: MemFsHost, R>(
        &self,
        store: &mut Store<T>,
        bytes: &[u8],
        f: impl FnOnce(&mut Store<T>, i32, i32) -> wasmtime::Result<R>,
    ) -> Result<R, MemFsError> {
        if mem::replace(&mut store.data_mut().bridge().scratch_live, true) {
            return Err(MemFsError::ScratchInUse);
        }

        let len = bytes.len() as i32;
        let result = self
            .stage(store, bytes)
            .and_then(|ptr| f(&mut *store, ptr, len));

        store.data_mut().bridge().scratch_live = false;
        let freed = self.tmp_free.call(&mut *store, ());

        let value = result?;
        freed?;
        Ok(value)
    }

    fn stage<T: MemFsHost>(&self, store: &mut Store<T>, bytes: &[u8]) -> wasmtime::Result<i32> {
        let ptr = self.tmp_alloc.call(&mut *store, bytes.len() as i32)?;
        self.memory.write(&mut *store, ptr as u32 as usize, bytes)?;
        Ok(ptr)
    }

    /// An export of the filesystem module, used to forward guest imports.
    pub fn export<T: MemFsHost>(&self, store: &mut Store<T>, name: &str) -> Result<Func, MemFsError> {
        self.instance
            .get_func(&mut *store, name)
            .ok_or_else(|| MemFsError::MissingExport(name.to_string()))
    }
}

fn typed<T, P, R>(store: &mut Store<T>, instance: &Instance, name: &str) -> Result<TypedFunc<P, R>, MemFsError>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    let func = instance
        .get_func(&mut *store, name)
        .ok_or_else(|| MemFsError::MissingExport(name.to_string()))?;
    Ok(func.typed::<P, R>(&*store)?)
}

// ============================================================================
// Imports of the filesystem module
// ============================================================================

/// Satisfy the module's imports, typed as the module declares them.
fn link<T: MemFsHost>(engine: &Engine, module: &Module) -> Result<Linker<T>, MemFsError> {
    let mut linker: Linker<T> = Linker::new(engine);

    for import in module.imports() {
        let ExternType::Func(ty) = import.ty() else {
            continue;
        };
        let (namespace, name) = (import.module(), import.name());

        match (namespace, name) {
            (INTERNAL, "now_ms") => {
                linker.func_new(INTERNAL, "now_ms", ty.clone(), move |_caller, _params, results| {
                    if let Some(slot) = results.first_mut() {
                        *slot = match slot_type(&ty) {
                            Some(ValType::I64) => Val::I64(now_ms() as i64),
                            Some(ValType::F64) => Val::F64((now_ms() as f64).to_bits()),
                            _ => Val::I32(now_ms() as i32),
                        };
                    }
                    Ok(())
                })?;
            }
            (INTERNAL, "trace") => {
                let results_ty = ty.clone();
                linker.func_new(INTERNAL, "trace", ty, move |mut caller, params, results| {
                    trace(&mut caller, params)?;
                    zero_results(&results_ty, results);
                    Ok(())
                })?;
            }
            (INTERNAL, "copy_out") => {
                let results_ty = ty.clone();
                linker.func_new(INTERNAL, "copy_out", ty, move |mut caller, params, results| {
                    let (guest, fs) = caller.data_mut().bridge().memories()?;
                    copy(&mut caller, params, fs, guest)?;
                    zero_results(&results_ty, results);
                    Ok(())
                })?;
            }
            (INTERNAL, "copy_in") => {
                let results_ty = ty.clone();
                linker.func_new(INTERNAL, "copy_in", ty, move |mut caller, params, results| {
                    let (guest, fs) = caller.data_mut().bridge().memories()?;
                    copy(&mut caller, params, guest, fs)?;
                    zero_results(&results_ty, results);
                    Ok(())
                })?;
            }
            (abi::NAMESPACE, "proc_exit") => {
                linker.func_new(abi::NAMESPACE, "proc_exit", ty, |_, _, _| Ok(()))?;
            }
            (abi::NAMESPACE, _) => {
                let results_ty = ty.clone();
                linker.func_new(abi::NAMESPACE, name, ty, move |_, _, results| {
                    zero_results(&results_ty, results);
                    if let Some(slot) = results.first_mut() {
                        *slot = Val::I32(Errno::NoSys.raw());
                    }
                    Ok(())
                })?;
            }
            _ => tracing::warn!(namespace, name, "filesystem module import left unresolved"),
        }
    }

    Ok(linker)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn slot_type(ty: &FuncType) -> Option<ValType> {
    ty.results().next()
}

fn zero_results(ty: &FuncType, results: &mut [Val]) {
    for (slot, ty) in results.iter_mut().zip(ty.results()) {
        *slot = match ty {
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0),
            ValType::F64 => Val::F64(0),
            _ => Val::I32(0),
        };
    }
}

/// `trace(is_error, addr, len)`: a UTF-8 message in filesystem memory.
fn trace<T: MemFsHost>(caller: &mut Caller<'_, T>, params: &[Val]) -> wasmtime::Result<()> {
    let is_error = arg_u32(params, 0)? != 0;
    let (addr, len) = (arg_u32(params, 1)?, arg_u32(params, 2)?);

    let fs = caller
        .data_mut()
        .bridge()
        .fs
        .ok_or_else(|| MemFsError::MissingExport("memory".into()))?;
    let mut bytes = vec![0u8; len as usize];
    fs.read(&*caller, addr as usize, &mut bytes)?;
    let message = String::from_utf8_lossy(&bytes).into_owned();

    if is_error {
        return Err(MemFsError::Trace(message).into());
    }
    tracing::info!(target: "memfs", "{message}");
    Ok(())
}

/// `(src, dst, len)`: move `len` bytes from `from` to `to`.
fn copy<T: MemFsHost>(
    caller: &mut Caller<'_, T>,
    params: &[Val],
    from: Memory,
    to: Memory,
) -> wasmtime::Result<()> {
    let (src, dst, len) = (arg_u32(params, 0)?, arg_u32(params, 1)?, arg_u32(params, 2)?);
    let mut bytes = vec![0u8; len as usize];
    from.read(&*caller, src as usize, &mut bytes)?;
    to.write(&mut *caller, dst as usize, &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct State {
        bridge: Bridge,
    }

    impl MemFsHost for State {
        fn bridge(&mut self) -> &mut Bridge {
            &mut self.bridge
        }
    }

    const FS: &str = r#"
        (module
            (import "internal" "trace" (func $trace (param i32 i32 i32)))
            (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (global $next (mut i32) (i32.const 1024))
            (global $seeded (mut i32) (i32.const 0))
            (global $wasi (mut i32) (i32.const 0))
            (data (i32.const 0) "seeded")
            (func (export "_start")
                (global.set $wasi (call $fd_write (i32.const 1) (i32.const 0) (i32.const 0) (i32.const 0))))
            (func (export "tmp_alloc") (param $size i32) (result i32)
                (local $ptr i32)
                (local.set $ptr (global.get $next))
                (global.set $next (i32.add (global.get $next) (local.get $size)))
                (local.get $ptr))
            (func (export "tmp_free") (global.set $next (i32.const 1024)))
            (func (export "initialize_internal") (param $ptr i32) (param $len i32) (result i32)
                (global.set $seeded (local.get $len))
                (call $trace (i32.const 0) (i32.const 0) (i32.const 6))
                (i32.const 0))
            (func (export "seeded") (result i32) (global.get $seeded))
            (func (export "wasi") (result i32) (global.get $wasi))
            (func (export "next") (result i32) (global.get $next))
            (func (export "fail") (call $trace (i32.const 1) (i32.const 0) (i32.const 6)))
        )
    "#;

    fn instantiate(store: &mut Store<State>) -> MemFs {
        let module = Module::new(store.engine(), FS).expect("module");
        let fs = BTreeMap::from([("/a".to_string(), "b".to_string())]);
        MemFs::instantiate(store, &module, &["/".to_string()], &fs).expect("instantiate")
    }

    fn call_i32(memfs: &MemFs, store: &mut Store<State>, name: &str) -> i32 {
        let func = memfs.export(store, name).expect("export");
        func.typed::<(), i32>(&*store)
            .expect("typed")
            .call(&mut *store, ())
            .expect("call")
    }

    #[test]
    fn seeds_with_json_and_releases_scratch() {
        let mut store = Store::new(&Engine::default(), State::default());
        let memfs = instantiate(&mut store);

        let expected = serde_json::to_vec(&serde_json::json!({
            "preopens": ["/"],
            "fs": { "/a": "b" },
        }))
        .unwrap();
        assert_eq!(call_i32(&memfs, &mut store, "seeded"), expected.len() as i32);
        assert_eq!(call_i32(&memfs, &mut store, "next"), 1024);
        assert!(!store.data().bridge.scratch_live);
    }

    #[test]
    fn unsupported_wasi_imports_report_nosys() {
        let mut store = Store::new(&Engine::default(), State::default());
        let memfs = instantiate(&mut store);
        assert_eq!(call_i32(&memfs, &mut store, "wasi"), Errno::NoSys.raw());
    }

    #[test]
    fn error_trace_is_fatal() {
        let mut store = Store::new(&Engine::default(), State::default());
        let memfs = instantiate(&mut store);

        let fail = memfs.export(&mut store, "fail").unwrap();
        let err = fail.call(&mut store, &[], &mut []).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MemFsError>(),
            Some(MemFsError::Trace(message)) if message == "seeded"
        ));
    }

    #[test]
    fn scratch_rejects_nesting_and_frees_on_error() {
        let mut store = Store::new(&Engine::default(), State::default());
        let memfs = instantiate(&mut store);

        let nested = memfs.with_scratch(&mut store, b"abc", |store, ptr, len| {
            assert_eq!((ptr, len), (1024, 3));
            assert!(store.data().bridge.scratch_live);
            Err::<(), _>(anyhow::anyhow!("inner failure"))
        });
        assert!(nested.is_err());
        assert!(!store.data().bridge.scratch_live);
        assert_eq!(call_i32(&memfs, &mut store, "next"), 1024);

        store.data_mut().bridge.scratch_live = true;
        let busy = memfs.with_scratch(&mut store, b"x", |_, _, _| Ok(()));
        assert!(matches!(busy, Err(MemFsError::ScratchInUse)));
    }

    #[test]
    fn missing_exports_are_reported() {
        let mut store = Store::new(&Engine::default(), State::default());
        let module = Module::new(store.engine(), r#"(module (memory (export "memory") 1))"#).unwrap();
        let err = MemFs::instantiate(&mut store, &module, &[], &BTreeMap::new()).err().unwrap();
        assert!(matches!(err, MemFsError::MissingExport(name) if name == "tmp_alloc"));
    }
}

//! WASI Host Runtime
//!
//! Runs a preview1 guest next to the in-memory filesystem module. Both live
//! in one [`Store<WasiState>`] as separate instances with separate memories.
//!
//! ```ignore
//! let runtime = Runtime::new(&memfs_wasm)?;
//! let module = runtime.load_module(&guest_wasm)?;
//! let status = runtime
//!     .run(&module, WasiOptions::new().arg("guest").return_on_exit(true))
//!     .await?;
//! ```

mod host;
mod syscalls;

pub use host::ImportsBuilder;

use crate::asyncify::{Asyncify, AsyncifyError, AsyncifyHost};
use crate::memfs::{Bridge, MemFs, MemFsError, MemFsHost};
use crate::streams::{ByteSink, ByteSource, FileDescriptor, StreamError};
use futures::future::{join_all, try_join_all};
use std::collections::BTreeMap;
use thiserror::Error;
use wasmtime::{Engine, Instance, Linker, Memory, Module, Store, Trap};

/// Status reported for `unreachable` when exits are returned, as a shell
/// reports SIGABRT.
pub const UNREACHABLE_STATUS: i32 = 134;

/// Raised by `proc_exit` to unwind the guest.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("proc_exit={code}")]
pub struct ProcessExit {
    pub code: i32,
}

#[derive(Error, Debug)]
pub enum LinkerError {
    #[error("Function registration failed: {0}")]
    FunctionRegistration(String),

    #[error(transparent)]
    Filesystem(#[from] MemFsError),
}

#[derive(Error, Debug)]
pub enum WasiError {
    #[error(transparent)]
    Exit(#[from] ProcessExit),

    #[error("Guest trapped: {0}")]
    Trap(Trap),

    #[error("Guest does not export {0}")]
    MissingExport(&'static str),

    #[error("Guest memory is not bound")]
    MemoryUnbound,

    #[error(transparent)]
    Linker(#[from] LinkerError),

    #[error(transparent)]
    Filesystem(#[from] MemFsError),

    #[error(transparent)]
    Asyncify(#[from] AsyncifyError),

    #[error("{source}{}", diagnostics(.stdout, .stderr))]
    Fatal {
        source: anyhow::Error,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },

    #[error("WASM error: {0}")]
    Wasm(String),
}

fn diagnostics(stdout: &[u8], stderr: &[u8]) -> String {
    if stdout.is_empty() && stderr.is_empty() {
        return String::new();
    }
    format!(
        "\n\nstdout:\n{}\n\nstderr:\n{}",
        String::from_utf8_lossy(stdout),
        String::from_utf8_lossy(stderr)
    )
}

/// How `_start` finished.
#[derive(Debug)]
pub enum Outcome {
    Return,
    Exit(i32),
    Trap(Trap),
    Failed(anyhow::Error),
}

impl Outcome {
    pub fn classify(result: wasmtime::Result<()>) -> Self {
        let error = match result {
            Ok(()) => return Outcome::Return,
            Err(error) => error,
        };
        if let Some(exit) = error.downcast_ref::<ProcessExit>() {
            Outcome::Exit(exit.code)
        } else if let Some(trap) = error.downcast_ref::<Trap>() {
            Outcome::Trap(*trap)
        } else {
            Outcome::Failed(error)
        }
    }
}

// ============================================================================
// Options
// ============================================================================

/// Configuration of one guest run.
pub struct WasiOptions {
    pub args: Vec<String>,
    /// Rendered as `KEY=VALUE`, in insertion order.
    pub env: Vec<(String, String)>,
    /// Turn `proc_exit` (and `unreachable`) into a returned status.
    pub return_on_exit: bool,
    pub preopens: Vec<String>,
    pub stdin: Option<ByteSource>,
    pub stdout: Option<ByteSink>,
    pub stderr: Option<ByteSink>,
    /// Requires an asyncify-instrumented guest.
    pub stream_stdio: bool,
    /// Initial file contents, keyed by path.
    pub fs: BTreeMap<String, String>,
    pub trace_imports: bool,
}

impl Default for WasiOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            env: Vec::new(),
            return_on_exit: false,
            preopens: Vec::new(),
            stdin: None,
            stdout: None,
            stderr: None,
            stream_stdio: true,
            fs: BTreeMap::new(),
            trace_imports: false,
        }
    }
}

impl WasiOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn return_on_exit(mut self, enabled: bool) -> Self {
        self.return_on_exit = enabled;
        self
    }

    pub fn preopen(mut self, dir: impl Into<String>) -> Self {
        self.preopens.push(dir.into());
        self
    }

    pub fn file(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.fs.insert(path.into(), contents.into());
        self
    }

    pub fn stdin(mut self, source: ByteSource) -> Self {
        self.stdin = Some(source);
        self
    }

    pub fn stdout(mut self, sink: ByteSink) -> Self {
        self.stdout = Some(sink);
        self
    }

    pub fn stderr(mut self, sink: ByteSink) -> Self {
        self.stderr = Some(sink);
        self
    }

    pub fn stream_stdio(mut self, enabled: bool) -> Self {
        self.stream_stdio = enabled;
        self
    }

    pub fn trace_imports(mut self, enabled: bool) -> Self {
        self.trace_imports = enabled;
        self
    }
}

// ============================================================================
// Process state
// ============================================================================

/// Store data shared by the guest and the filesystem instance.
pub struct WasiState {
    args: Vec<String>,
    env: Vec<String>,
    memory: Option<Memory>,
    streams: [FileDescriptor; 3],
    streaming: bool,
    trace_imports: bool,
    asyncify: Asyncify<WasiState>,
    bridge: Bridge,
}

impl AsyncifyHost for WasiState {
    fn asyncify(&mut self) -> &mut Asyncify<Self> {
        &mut self.asyncify
    }
}

impl MemFsHost for WasiState {
    fn bridge(&mut self) -> &mut Bridge {
        &mut self.bridge
    }
}

impl WasiState {
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Environment entries as the guest sees them.
    pub fn env(&self) -> &[String] {
        &self.env
    }
}

// ============================================================================
// Façade
// ============================================================================

/// One guest process: its store, its filesystem instance and its streams.
pub struct Wasi {
    store: Store<WasiState>,
    memfs: MemFs,
    return_on_exit: bool,
}

impl Wasi {
    /// Build the process and instantiate and seed the filesystem module.
    pub fn new(engine: &Engine, memfs: &Module, options: WasiOptions) -> Result<Self, WasiError> {
        let WasiOptions {
            args,
            env,
            return_on_exit,
            preopens,
            stdin,
            stdout,
            stderr,
            stream_stdio,
            fs,
            trace_imports,
        } = options;

        let state = WasiState {
            args,
            env: env.into_iter().map(|(key, value)| format!("{key}={value}")).collect(),
            memory: None,
            streams: [
                FileDescriptor::from_source(stdin, stream_stdio),
                FileDescriptor::from_sink(stdout, stream_stdio),
                FileDescriptor::from_sink(stderr, stream_stdio),
            ],
            streaming: stream_stdio,
            trace_imports,
            asyncify: Asyncify::new(),
            bridge: Bridge::default(),
        };

        let mut store = Store::new(engine, state);
        let memfs = MemFs::instantiate(&mut store, memfs, &preopens, &fs)?;

        Ok(Self {
            store,
            memfs,
            return_on_exit,
        })
    }

    /// Install the `wasi_snapshot_preview1` import table.
    pub fn add_to_linker(&mut self, linker: &mut Linker<WasiState>) -> Result<(), WasiError> {
        host::install(linker, &mut self.store, &self.memfs)?;
        Ok(())
    }

    /// Instantiate the guest in this process's store.
    pub fn instantiate(&mut self, linker: &Linker<WasiState>, module: &Module) -> Result<Instance, WasiError> {
        linker
            .instantiate(&mut self.store, module)
            .map_err(|e| WasiError::Wasm(e.to_string()))
    }

    pub fn state(&self) -> &WasiState {
        self.store.data()
    }

    /// Run the guest to completion.
    ///
    /// Streams are closed and flushed on every path, including failures.
    /// Returns `None` if `_start` returned and `Some(status)` for an exit
    /// turned into a status by `return_on_exit`.
    pub async fn start(mut self, instance: Instance) -> Result<Option<i32>, WasiError> {
        tracing::debug!(streaming = self.store.data().streaming, "starting guest");
        let result = self.run(&instance).await;

        let streams = &self.store.data().streams;
        let (stdout, stderr) = (streams[1].buffered().to_vec(), streams[2].buffered().to_vec());
        let cleanup = self.cleanup().await;

        let outcome = Outcome::classify(result);
        tracing::debug!(?outcome, "guest finished");

        match (self.settle(outcome, stdout.clone(), stderr.clone()), cleanup) {
            (Ok(status), Ok(())) => Ok(status),
            (Ok(_), Err(e)) => Err(WasiError::Fatal {
                source: e.into(),
                stdout,
                stderr,
            }),
            (Err(e), Err(cleanup)) => {
                tracing::warn!(error = %cleanup, "stream cleanup failed after guest failure");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    async fn run(&mut self, instance: &Instance) -> wasmtime::Result<()> {
        let memory = instance
            .get_memory(&mut self.store, "memory")
            .ok_or(WasiError::MissingExport("memory"))?;
        let state = self.store.data_mut();
        state.memory = Some(memory);
        state.bridge.bind_guest(memory);

        let streaming = state.streaming;
        if streaming {
            Asyncify::init(&mut self.store, instance)?;
        }

        try_join_all(self.store.data_mut().streams.iter_mut().map(|s| s.pre_run())).await?;

        if streaming {
            Asyncify::call_entrypoint(&mut self.store).await
        } else {
            let entry = instance
                .get_func(&mut self.store, "_start")
                .ok_or(WasiError::MissingExport("_start"))?;
            entry.typed::<(), ()>(&self.store)?.call(&mut self.store, ())
        }
    }

    /// Close every stream, then flush every stream, regardless of failures.
    async fn cleanup(&mut self) -> Result<(), StreamError> {
        let streams = &mut self.store.data_mut().streams;
        let closed = join_all(streams.iter_mut().map(|s| s.close())).await;
        let flushed = join_all(streams.iter_mut().map(|s| s.post_run())).await;
        closed.into_iter().chain(flushed).collect()
    }

    fn settle(&self, outcome: Outcome, stdout: Vec<u8>, stderr: Vec<u8>) -> Result<Option<i32>, WasiError> {
        match outcome {
            Outcome::Return => Ok(None),
            Outcome::Exit(code) if self.return_on_exit => Ok(Some(code)),
            Outcome::Trap(Trap::UnreachableCodeReached) if self.return_on_exit => {
                Ok(Some(UNREACHABLE_STATUS))
            }
            Outcome::Exit(code) => Err(ProcessExit { code }.into()),
            Outcome::Trap(trap) => Err(WasiError::Trap(trap)),
            Outcome::Failed(source) => {
                tracing::error!(error = %source, "guest run failed");
                Err(WasiError::Fatal {
                    source,
                    stdout,
                    stderr,
                })
            }
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// An engine plus the compiled filesystem module, shared by every run.
pub struct Runtime {
    engine: Engine,
    memfs: Module,
}

impl Runtime {
    pub fn new(memfs_wasm: &[u8]) -> Result<Self, WasiError> {
        Self::with_engine(Engine::default(), memfs_wasm)
    }

    pub fn with_engine(engine: Engine, memfs_wasm: &[u8]) -> Result<Self, WasiError> {
        let memfs = Module::new(&engine, memfs_wasm).map_err(|e| WasiError::Wasm(e.to_string()))?;
        Ok(Self { engine, memfs })
    }

    /// Compile a guest module.
    pub fn load_module(&self, wasm_bytes: &[u8]) -> Result<Module, WasiError> {
        Module::new(&self.engine, wasm_bytes).map_err(|e| WasiError::Wasm(e.to_string()))
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// A fresh process with its own filesystem instance.
    pub fn wasi(&self, options: WasiOptions) -> Result<Wasi, WasiError> {
        Wasi::new(&self.engine, &self.memfs, options)
    }

    /// Link, instantiate and start `module`.
    pub async fn run(&self, module: &Module, options: WasiOptions) -> Result<Option<i32>, WasiError> {
        let mut wasi = self.wasi(options)?;
        let mut linker = Linker::new(&self.engine);
        wasi.add_to_linker(&mut linker)?;
        let instance = wasi.instantiate(&linker, module)?;
        wasi.start(instance).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_defaults() {
        let options = WasiOptions::default();
        assert!(options.args.is_empty());
        assert!(options.env.is_empty());
        assert!(!options.return_on_exit);
        assert!(options.preopens.is_empty());
        assert!(options.stdin.is_none() && options.stdout.is_none() && options.stderr.is_none());
        assert!(options.stream_stdio);
        assert!(options.fs.is_empty());
        assert!(!options.trace_imports);
    }

    #[test]
    fn option_builders_accumulate() {
        let options = WasiOptions::new()
            .arg("prog")
            .args(["-v", "x"])
            .env("B", "2")
            .env("A", "1")
            .preopen("/")
            .file("/a.txt", "hi")
            .stream_stdio(false);

        assert_eq!(options.args, ["prog", "-v", "x"]);
        assert_eq!(
            options.env,
            [("B".to_string(), "2".to_string()), ("A".to_string(), "1".to_string())]
        );
        assert_eq!(options.preopens, ["/"]);
        assert_eq!(options.fs.get("/a.txt").map(String::as_str), Some("hi"));
        assert!(!options.stream_stdio);
    }

    #[test]
    fn process_exit_display() {
        assert_eq!(ProcessExit { code: 3 }.to_string(), "proc_exit=3");
    }

    #[test]
    fn classify_outcomes() {
        assert!(matches!(Outcome::classify(Ok(())), Outcome::Return));
        assert!(matches!(
            Outcome::classify(Err(ProcessExit { code: 9 }.into())),
            Outcome::Exit(9)
        ));
        assert!(matches!(
            Outcome::classify(Err(Trap::UnreachableCodeReached.into())),
            Outcome::Trap(Trap::UnreachableCodeReached)
        ));
        assert!(matches!(
            Outcome::classify(Err(anyhow::anyhow!("boom"))),
            Outcome::Failed(_)
        ));
    }

    #[test]
    fn fatal_errors_carry_buffered_output() {
        let err = WasiError::Fatal {
            source: anyhow::anyhow!("boom"),
            stdout: b"partial".to_vec(),
            stderr: Vec::new(),
        };
        let message = err.to_string();
        assert!(message.starts_with("boom"));
        assert!(message.contains("stdout:\npartial"));

        let bare = WasiError::Fatal {
            source: anyhow::anyhow!("boom"),
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        assert_eq!(bare.to_string(), "boom");
    }
}

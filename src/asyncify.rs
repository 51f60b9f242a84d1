//! Asyncify Bridging
//!
//! Lets an import that has to wait on the host suspend the guest's whole call
//! stack and pick up later where it left off. The guest must have been built
//! with binaryen's asyncify transform, which exports the
//! `asyncify_{start,stop}_{unwind,rewind}` / `asyncify_get_state` controls.
//!
//! ```text
//!   Normal ──import suspends──▶ Unwinding ──host op done──▶ Rewinding ──import reached──▶ Normal
//! ```
//!
//! While unwinding, the guest returns all the way out of `_start`. The host
//! awaits the operation, then calls `_start` again with rewinding enabled; the
//! guest replays its frames down to the import, which this time returns the
//! saved result instead of starting the operation again.

use futures::future::BoxFuture;
use std::future::Future;
use std::mem;
use thiserror::Error;
use wasmtime::{AsContextMut, Caller, Instance, Store, StoreContextMut, TypedFunc};

/// Address of the unwind/rewind data header in guest memory.
pub const DATA_ADDR: u32 = 16;

/// End of the region used to save the unwound stack.
pub const DATA_END: u32 = 1024;

#[derive(Error, Debug)]
pub enum AsyncifyError {
    #[error("Missing asyncify export: {0}")]
    MissingExport(&'static str),

    #[error("Asyncify used before init")]
    Uninitialized,

    #[error("Invalid async state {0}, expected 0")]
    InvalidState(i32),

    #[error("Import entered while an unwind is in flight")]
    Reentered,

    #[error("Rewind reached an import with no saved result")]
    NoSavedValue,

    #[error("Guest unwound without a suspended import")]
    NoSuspension,
}

/// Value of `asyncify_get_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Normal,
    Unwinding,
    Rewinding,
}

impl State {
    fn from_raw(raw: i32) -> Result<Self, AsyncifyError> {
        match raw {
            0 => Ok(State::Normal),
            1 => Ok(State::Unwinding),
            2 => Ok(State::Rewinding),
            other => Err(AsyncifyError::InvalidState(other)),
        }
    }
}

/// Completes a suspended import once its host operation has finished. Runs
/// with fresh store access, so any guest memory it touches is re-acquired.
pub type Resume<T> = Box<dyn FnOnce(StoreContextMut<'_, T>) -> wasmtime::Result<i32> + Send>;

/// A host operation an import is waiting on.
pub struct Suspension<T> {
    future: BoxFuture<'static, wasmtime::Result<Resume<T>>>,
}

impl<T> Suspension<T> {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = wasmtime::Result<Resume<T>>> + Send + 'static,
    {
        Self {
            future: Box::pin(future),
        }
    }
}

/// What an import produced.
pub enum Call<T> {
    Ready(i32),
    Suspend(Suspension<T>),
}

impl<T> Call<T> {
    /// For imports running without asyncify, where suspending is impossible.
    pub fn into_ready(self) -> wasmtime::Result<i32> {
        match self {
            Call::Ready(value) => Ok(value),
            Call::Suspend(_) => Err(AsyncifyError::Uninitialized.into()),
        }
    }
}

enum Phase<T> {
    Normal,
    Unwinding(Suspension<T>),
    Rewinding(i32),
}

#[derive(Clone)]
struct Exports {
    entry: TypedFunc<(), ()>,
    start_unwind: TypedFunc<i32, ()>,
    stop_unwind: TypedFunc<(), ()>,
    start_rewind: TypedFunc<i32, ()>,
    stop_rewind: TypedFunc<(), ()>,
    get_state: TypedFunc<(), i32>,
}

impl Exports {
    fn state(&self, mut store: impl AsContextMut) -> wasmtime::Result<State> {
        let raw = self.get_state.call(&mut store, ())?;
        Ok(State::from_raw(raw)?)
    }

    fn expect_normal(&self, store: impl AsContextMut) -> wasmtime::Result<()> {
        match self.state(store)? {
            State::Normal => Ok(()),
            State::Unwinding => Err(AsyncifyError::InvalidState(1).into()),
            State::Rewinding => Err(AsyncifyError::InvalidState(2).into()),
        }
    }
}

/// Store data that carries an asyncify bridge.
pub trait AsyncifyHost: Sized + 'static {
    fn asyncify(&mut self) -> &mut Asyncify<Self>;
}

/// Per-instance bridge state: the guest's controls plus the one saved
/// continuation that may be outstanding.
pub struct Asyncify<T> {
    exports: Option<Exports>,
    phase: Phase<T>,
}

impl<T> Default for Asyncify<T> {
    fn default() -> Self {
        Self {
            exports: None,
            phase: Phase::Normal,
        }
    }
}

impl<T: AsyncifyHost> Asyncify<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn exports(&self) -> Result<Exports, AsyncifyError> {
        self.exports.clone().ok_or(AsyncifyError::Uninitialized)
    }

    /// Bind to an instrumented guest and lay out the data header.
    pub fn init(store: &mut Store<T>, instance: &Instance) -> wasmtime::Result<()> {
        fn func<P, R>(
            store: &mut Store<impl AsyncifyHost>,
            instance: &Instance,
            name: &'static str,
        ) -> wasmtime::Result<TypedFunc<P, R>>
        where
            P: wasmtime::WasmParams,
            R: wasmtime::WasmResults,
        {
            if instance.get_func(&mut *store, name).is_none() {
                return Err(AsyncifyError::MissingExport(name).into());
            }
            instance.get_typed_func::<P, R>(&mut *store, name)
        }

        let exports = Exports {
            entry: func(store, instance, "_start")?,
            start_unwind: func(store, instance, "asyncify_start_unwind")?,
            stop_unwind: func(store, instance, "asyncify_stop_unwind")?,
            start_rewind: func(store, instance, "asyncify_start_rewind")?,
            stop_rewind: func(store, instance, "asyncify_stop_rewind")?,
            get_state: func(store, instance, "asyncify_get_state")?,
        };

        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or(AsyncifyError::MissingExport("memory"))?;
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&(DATA_ADDR + 8).to_le_bytes());
        header[4..].copy_from_slice(&DATA_END.to_le_bytes());
        memory.write(&mut *store, DATA_ADDR as usize, &header)?;

        let asyncify = store.data_mut().asyncify();
        asyncify.exports = Some(exports);
        asyncify.phase = Phase::Normal;
        Ok(())
    }

    /// Run an import under the bridge.
    ///
    /// During a rewind the import is not run again; the saved result is
    /// returned instead. An import that suspends starts an unwind and returns
    /// a placeholder the guest discards.
    pub fn wrap_import<F>(caller: &mut Caller<'_, T>, call: F) -> wasmtime::Result<i32>
    where
        F: FnOnce(&mut Caller<'_, T>) -> wasmtime::Result<Call<T>>,
    {
        let exports = caller.data_mut().asyncify().exports()?;

        match exports.state(&mut *caller)? {
            State::Rewinding => {
                exports.stop_rewind.call(&mut *caller, ())?;
                let phase = mem::replace(&mut caller.data_mut().asyncify().phase, Phase::Normal);
                return match phase {
                    Phase::Rewinding(value) => Ok(value),
                    _ => Err(AsyncifyError::NoSavedValue.into()),
                };
            }
            State::Unwinding => return Err(AsyncifyError::Reentered.into()),
            State::Normal => {}
        }

        match call(caller)? {
            Call::Ready(value) => Ok(value),
            Call::Suspend(suspension) => {
                let asyncify = caller.data_mut().asyncify();
                if !matches!(asyncify.phase, Phase::Normal) {
                    return Err(AsyncifyError::Reentered.into());
                }
                asyncify.phase = Phase::Unwinding(suspension);
                exports.start_unwind.call(&mut *caller, DATA_ADDR as i32)?;
                Ok(0)
            }
        }
    }

    /// Call `_start`, driving unwind/rewind cycles until it really returns.
    pub async fn call_entrypoint(store: &mut Store<T>) -> wasmtime::Result<()> {
        let exports = store.data_mut().asyncify().exports()?;

        exports.expect_normal(&mut *store)?;
        exports.entry.call(&mut *store, ())?;

        while exports.state(&mut *store)? == State::Unwinding {
            exports.stop_unwind.call(&mut *store, ())?;

            let phase = mem::replace(&mut store.data_mut().asyncify().phase, Phase::Normal);
            let Phase::Unwinding(suspension) = phase else {
                return Err(AsyncifyError::NoSuspension.into());
            };

            tracing::debug!("asyncify: unwound, awaiting host operation");
            let resume = suspension.future.await?;
            let value = resume(store.as_context_mut())?;
            store.data_mut().asyncify().phase = Phase::Rewinding(value);

            exports.expect_normal(&mut *store)?;
            tracing::debug!(value, "asyncify: rewinding");
            exports.start_rewind.call(&mut *store, DATA_ADDR as i32)?;
            exports.entry.call(&mut *store, ())?;
        }

        exports.expect_normal(&mut *store)?;
        if matches!(store.data_mut().asyncify().phase, Phase::Rewinding(_)) {
            return Err(AsyncifyError::NoSavedValue.into());
        }
        Ok(())
    }
}

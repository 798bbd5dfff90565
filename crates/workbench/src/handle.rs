//! Owner of the session's single sandbox instance.
//!
//! The instance is booted lazily by the first [`SandboxHandle::acquire`].
//! Concurrent callers share one in-flight boot. Each boot gets a generation
//! number; teardown bumps it, so a boot or error listener from an older
//! generation can never publish or tear down a newer instance.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use sandbox::{SandboxConfig, SandboxError, SandboxInstance, SandboxRuntime};
use tracing::{error, info, warn};

use crate::error::{Result, WorkbenchError};

/// Boot errors are handed to every waiter, so they must be `Clone`.
#[derive(Debug, Clone)]
enum BootError {
    Timeout(Duration),
    Failed(String),
    Cancelled,
}

impl From<BootError> for WorkbenchError {
    fn from(e: BootError) -> Self {
        match e {
            BootError::Timeout(after) => WorkbenchError::BootTimeout(after),
            BootError::Failed(msg) => WorkbenchError::BootFailed(msg),
            BootError::Cancelled => WorkbenchError::BootCancelled,
        }
    }
}

type Instance = Arc<dyn SandboxInstance>;
type BootFuture = Shared<BoxFuture<'static, std::result::Result<Instance, BootError>>>;

enum Slot {
    Empty,
    Booting(BootFuture),
    Ready(Instance),
}

struct State {
    generation: u64,
    slot: Slot,
}

struct Inner {
    runtime: Arc<dyn SandboxRuntime>,
    boot_timeout: Duration,
    env: Vec<(String, String)>,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle; clones share the same instance.
#[derive(Clone)]
pub struct SandboxHandle {
    inner: Arc<Inner>,
}

impl SandboxHandle {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, boot_timeout: Duration) -> Self {
        Self::with_env(runtime, boot_timeout, Vec::new())
    }

    /// Like [`SandboxHandle::new`], passing `env` to every booted instance.
    pub fn with_env(
        runtime: Arc<dyn SandboxRuntime>,
        boot_timeout: Duration,
        env: Vec<(String, String)>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                boot_timeout,
                env,
                state: Mutex::new(State {
                    generation: 0,
                    slot: Slot::Empty,
                }),
            }),
        }
    }

    /// The live instance, booting one if needed.
    ///
    /// Fails with `EnvironmentUnsupported` before booting when the runtime's
    /// precondition is not met, and with `BootTimeout` when the boot takes
    /// longer than the configured timeout. A failed boot leaves the handle
    /// empty, so the next call boots again.
    pub async fn acquire(&self) -> Result<Instance> {
        let boot = {
            let mut state = self.inner.lock();
            match &state.slot {
                Slot::Ready(instance) => return Ok(Arc::clone(instance)),
                Slot::Booting(boot) => boot.clone(),
                Slot::Empty => {
                    self.inner.runtime.check_environment().map_err(|e| match e {
                        SandboxError::EnvironmentUnsupported(reason) => {
                            WorkbenchError::EnvironmentUnsupported(reason)
                        }
                        other => WorkbenchError::Sandbox(other),
                    })?;
                    state.generation += 1;
                    let boot = boot_instance(Arc::clone(&self.inner), state.generation).shared();
                    state.slot = Slot::Booting(boot.clone());
                    boot
                }
            }
        };
        boot.await.map_err(WorkbenchError::from)
    }

    /// The live instance, without booting.
    pub fn current(&self) -> Option<Instance> {
        match &self.inner.lock().slot {
            Slot::Ready(instance) => Some(Arc::clone(instance)),
            Slot::Empty | Slot::Booting(_) => None,
        }
    }

    pub fn is_booting(&self) -> bool {
        matches!(self.inner.lock().slot, Slot::Booting(_))
    }

    /// Kill every process, tear the instance down and forget it. Cancels an
    /// in-flight boot. Errors are logged, never returned; a no-op when
    /// nothing is booted.
    pub async fn teardown(&self) {
        let instance = {
            let mut state = self.inner.lock();
            state.generation += 1;
            match std::mem::replace(&mut state.slot, Slot::Empty) {
                Slot::Ready(instance) => Some(instance),
                Slot::Booting(_) => {
                    info!("teardown cancelled in-flight boot");
                    None
                }
                Slot::Empty => None,
            }
        };
        if let Some(instance) = instance {
            shutdown(instance).await;
        }
    }
}

fn boot_instance(
    inner: Arc<Inner>,
    generation: u64,
) -> BoxFuture<'static, std::result::Result<Instance, BootError>> {
    async move {
        let mut config = SandboxConfig::new();
        config.env = inner.env.clone();
        info!(runtime = inner.runtime.name(), id = %config.id, generation, "booting sandbox");

        let booted = match tokio::time::timeout(inner.boot_timeout, inner.runtime.boot(config)).await
        {
            Ok(Ok(instance)) => Ok(instance),
            Ok(Err(e)) => Err(BootError::Failed(e.to_string())),
            Err(_) => Err(BootError::Timeout(inner.boot_timeout)),
        };

        let instance = match booted {
            Ok(instance) => instance,
            Err(e) => {
                let mut state = inner.lock();
                if state.generation == generation {
                    state.slot = Slot::Empty;
                }
                warn!(generation, error = ?e, "sandbox boot failed");
                return Err(e);
            }
        };

        register_error_listener(&inner, &instance, generation);

        let current = {
            let mut state = inner.lock();
            if state.generation == generation {
                state.slot = Slot::Ready(Arc::clone(&instance));
                true
            } else {
                false
            }
        };
        if !current {
            warn!(id = instance.id(), "sandbox finished booting after teardown");
            shutdown(instance).await;
            return Err(BootError::Cancelled);
        }

        info!(id = instance.id(), generation, "sandbox ready");
        Ok(instance)
    }
    .boxed()
}

/// Tear the instance down when it reports a fatal error, unless a newer
/// generation has replaced it by then.
fn register_error_listener(inner: &Arc<Inner>, instance: &Instance, generation: u64) {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let id = instance.id().to_owned();
    instance.on_error(Box::new(move |err| {
        error!(id = %id, error = %err, "fatal sandbox error");
        let Some(inner) = weak.upgrade() else { return };

        let stale = {
            let mut state = inner.lock();
            if state.generation != generation {
                return;
            }
            state.generation += 1;
            std::mem::replace(&mut state.slot, Slot::Empty)
        };
        if let Slot::Ready(instance) = stale {
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn(shutdown(instance));
                }
                Err(_) => warn!(id = %id, "no runtime to tear down sandbox"),
            }
        }
    }));
}

/// Best-effort: kill owned processes, then tear the instance down.
async fn shutdown(instance: Instance) {
    match instance.list_processes().await {
        Ok(processes) => {
            for process in processes {
                if let Err(e) = instance.kill(process.pid).await {
                    warn!(id = instance.id(), pid = process.pid, error = %e, "kill failed");
                }
            }
        }
        Err(e) => warn!(id = instance.id(), error = %e, "list processes failed"),
    }
    if let Err(e) = instance.teardown().await {
        warn!(id = instance.id(), error = %e, "sandbox teardown failed");
    }
    info!(id = instance.id(), "sandbox torn down");
}

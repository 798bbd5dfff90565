use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{SandboxConfig, SandboxError, SandboxInstance, SandboxRuntime};

use crate::lock;
use crate::sandbox::MockSandbox;
use crate::script::ProcessScript;

pub(crate) type Scripts = Arc<Mutex<HashMap<String, ProcessScript>>>;

/// In-memory runtime. Cloning shares all state.
#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<RuntimeState>,
}

#[derive(Default)]
struct RuntimeState {
    boots: AtomicUsize,
    boot_delay: Mutex<Duration>,
    boot_failure: Mutex<Option<String>>,
    unsupported: Mutex<Option<String>>,
    scripts: Scripts,
    instances: Mutex<Vec<Arc<MockSandbox>>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every boot by `delay` (use with a paused clock).
    pub fn set_boot_delay(&self, delay: Duration) {
        *lock(&self.state.boot_delay) = delay;
    }

    /// Make every following boot fail with `BootFailed(message)`.
    pub fn fail_boot(&self, message: &str) {
        *lock(&self.state.boot_failure) = Some(message.to_owned());
    }

    /// Make `check_environment()` report an unsupported host.
    pub fn set_unsupported(&self, reason: &str) {
        *lock(&self.state.unsupported) = Some(reason.to_owned());
    }

    /// Script the process spawned for `command_line` (e.g. `"npm install"`).
    /// Unscripted commands exit 0 without output.
    pub fn script(&self, command_line: &str, script: ProcessScript) {
        lock(&self.state.scripts).insert(command_line.to_owned(), script);
    }

    /// Number of `boot()` calls so far, including failed ones.
    pub fn boot_count(&self) -> usize {
        self.state.boots.load(Ordering::SeqCst)
    }

    pub fn instances(&self) -> Vec<Arc<MockSandbox>> {
        lock(&self.state.instances).clone()
    }

    pub fn last_instance(&self) -> Option<Arc<MockSandbox>> {
        lock(&self.state.instances).last().cloned()
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    fn check_environment(&self) -> sandbox::Result<()> {
        match lock(&self.state.unsupported).clone() {
            Some(reason) => Err(SandboxError::EnvironmentUnsupported(reason)),
            None => Ok(()),
        }
    }

    async fn boot(&self, config: SandboxConfig) -> sandbox::Result<Arc<dyn SandboxInstance>> {
        self.state.boots.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&self.state.boot_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = lock(&self.state.boot_failure).clone() {
            return Err(SandboxError::BootFailed(message));
        }

        let sandbox = Arc::new(MockSandbox::new(
            config.id.to_string(),
            Arc::clone(&self.state.scripts),
        ));
        lock(&self.state.instances).push(Arc::clone(&sandbox));
        Ok(sandbox)
    }
}

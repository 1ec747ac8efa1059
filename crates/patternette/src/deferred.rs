//! Pattern handle usable before its interpreter has started.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use glowproto::{AudioState, EntityData, PatternConfig};
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::error::ScriptError;
use crate::instance::{PatternInstance, PatternSource};
use crate::sandbox::SandboxConfig;

/// Stands in for a [`PatternInstance`] while it is being built.
///
/// Until the instance exists, [`DeferredPattern::calculate`] returns an empty
/// frame without blocking. Afterwards it forwards to the instance.
pub struct DeferredPattern {
    id: String,
    instance: OnceLock<Arc<PatternInstance>>,
    failure: Mutex<Option<String>>,
    disposed: AtomicBool,
    settled: Notify,
}

impl DeferredPattern {
    pub fn pending(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            instance: OnceLock::new(),
            failure: Mutex::new(None),
            disposed: AtomicBool::new(false),
            settled: Notify::new(),
        })
    }

    /// Start building `source` on the blocking pool. Without a tokio runtime
    /// the instance is built on the calling thread.
    pub fn spawn(source: PatternSource, sandbox: SandboxConfig) -> Arc<Self> {
        let deferred = Self::pending(source.id.clone());
        let target = deferred.clone();
        let build = move || target.resolve(PatternInstance::new(source, sandbox));

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(build);
            }
            Err(_) => build(),
        }
        deferred
    }

    /// Deliver the outcome of building the instance.
    pub fn resolve(&self, result: Result<PatternInstance, ScriptError>) {
        match result {
            Ok(instance) => {
                let instance = Arc::new(instance);
                if self.disposed.load(Ordering::Acquire) || self.instance.set(instance.clone()).is_err()
                {
                    instance.dispose();
                } else if self.disposed.load(Ordering::Acquire) {
                    // disposed between the check and the set
                    instance.dispose();
                } else {
                    debug!(pattern = %self.id, "Deferred pattern ready");
                }
            }
            Err(err) => {
                let kind = err.kind();
                error!(
                    pattern = %self.id,
                    kind = %kind,
                    hint = kind.hint(),
                    "Pattern failed to start: {err}"
                );
                *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
            }
        }
        self.settled.notify_waiters();
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn calculate(&self, audio: &AudioState, config: &PatternConfig, dt: f64) -> Vec<EntityData> {
        match self.instance.get() {
            Some(instance) => instance.calculate(audio, config, dt),
            None => Vec::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.instance.get().is_some_and(|i| i.is_ready())
    }

    /// Message of the build failure, if the instance never started.
    pub fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_settled(&self) -> bool {
        self.instance.get().is_some() || self.failure().is_some() || self.disposed.load(Ordering::Acquire)
    }

    /// Wait until the build has finished, failed or been abandoned.
    pub async fn settled(&self) {
        loop {
            let notified = self.settled.notified();
            if self.is_settled() {
                return;
            }
            notified.await;
        }
    }

    pub fn instance(&self) -> Option<Arc<PatternInstance>> {
        self.instance.get().cloned()
    }

    /// Dispose the instance now, or as soon as it finishes building.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        if let Some(instance) = self.instance.get() {
            instance.dispose();
        }
        self.settled.notify_waiters();
    }
}

impl std::fmt::Debug for DeferredPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredPattern")
            .field("id", &self.id)
            .field("ready", &self.is_ready())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

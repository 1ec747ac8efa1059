//! A pattern bound to its own interpreter session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use glowproto::{AudioState, EntityData, PatternConfig};
use tracing::{debug, error, warn};

use crate::error::ScriptError;
use crate::runtime::{FrameInput, LuaRuntime, ScriptRuntime};
use crate::sandbox::SandboxConfig;

/// Global function every pattern must define.
pub const ENTRY_POINT: &str = "calculate";

/// Longest frame step handed to a pattern, in seconds.
const MAX_DT: f64 = 1.0;

/// Everything needed to (re)build a pattern's interpreter.
#[derive(Debug, Clone)]
pub struct PatternSource {
    pub id: String,
    pub library: Arc<str>,
    pub source: Arc<str>,
}

/// Builds a compiled, resolved runtime for a pattern source.
pub type RuntimeBuilder = Arc<
    dyn Fn(&PatternSource, &SandboxConfig) -> Result<Box<dyn ScriptRuntime>, ScriptError>
        + Send
        + Sync,
>;

/// The builder used outside tests: one sandboxed Lua state with the shared
/// library loaded ahead of the pattern.
pub fn lua_builder() -> RuntimeBuilder {
    Arc::new(build_lua_runtime)
}

fn build_lua_runtime(
    source: &PatternSource,
    sandbox: &SandboxConfig,
) -> Result<Box<dyn ScriptRuntime>, ScriptError> {
    let mut runtime = LuaRuntime::new(&source.id, sandbox)?;
    runtime.compile("lib", &source.library)?;
    runtime.compile(&source.id, &source.source)?;
    runtime.resolve(ENTRY_POINT)?;
    Ok(Box::new(runtime))
}

/// Counters for one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceStats {
    pub frames: u64,
    pub failures: u64,
    pub budget_overruns: u64,
    pub restarts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames: AtomicU64,
    failures: AtomicU64,
    budget_overruns: AtomicU64,
    restarts: AtomicU64,
}

/// A live pattern: one runtime, one private `state` table.
///
/// Calls are serialized by a mutex. `ready` is checked before and after
/// taking the lock, so a call racing [`PatternInstance::dispose`] either
/// finishes before the runtime is released or never reaches it.
pub struct PatternInstance {
    source: PatternSource,
    sandbox: SandboxConfig,
    builder: RuntimeBuilder,
    ready: AtomicBool,
    runtime: Mutex<Option<Box<dyn ScriptRuntime>>>,
    counters: Counters,
}

impl PatternInstance {
    pub fn new(source: PatternSource, sandbox: SandboxConfig) -> Result<Self, ScriptError> {
        Self::with_builder(source, sandbox, lua_builder())
    }

    pub fn with_builder(
        source: PatternSource,
        sandbox: SandboxConfig,
        builder: RuntimeBuilder,
    ) -> Result<Self, ScriptError> {
        let runtime = builder(&source, &sandbox)?;
        debug!(pattern = %source.id, "Pattern instance ready");
        Ok(Self {
            source,
            sandbox,
            builder,
            ready: AtomicBool::new(true),
            runtime: Mutex::new(Some(runtime)),
            counters: Counters::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.source.id
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Run one frame. Any script failure yields an empty frame.
    pub fn calculate(&self, audio: &AudioState, config: &PatternConfig, dt: f64) -> Vec<EntityData> {
        if !self.is_ready() {
            return Vec::new();
        }

        let mut guard = self.lock_runtime();
        if !self.is_ready() {
            return Vec::new();
        }
        let Some(runtime) = guard.as_mut() else {
            return Vec::new();
        };

        let audio = audio.clamped();
        let config = config.sanitized();
        let dt = if dt.is_finite() { dt.clamp(0.0, MAX_DT) } else { 0.0 };
        let input = FrameInput {
            audio: &audio,
            config: &config,
            dt,
        };

        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        match runtime.invoke(ENTRY_POINT, &input) {
            Ok(entities) => entities,
            Err(err @ ScriptError::BudgetExceeded { .. }) => {
                self.counters.budget_overruns.fetch_add(1, Ordering::Relaxed);
                warn!(
                    pattern = %self.source.id,
                    kind = %err.kind(),
                    "{err}; recreating instance"
                );
                self.restart(&mut guard);
                Vec::new()
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                let kind = err.kind();
                warn!(
                    pattern = %self.source.id,
                    kind = %kind,
                    hint = kind.hint(),
                    "Pattern frame failed: {err}"
                );
                Vec::new()
            }
        }
    }

    /// Replace a runtime whose state may be inconsistent after an aborted call.
    fn restart(&self, slot: &mut Option<Box<dyn ScriptRuntime>>) {
        if let Some(mut old) = slot.take() {
            old.dispose();
        }
        match (self.builder)(&self.source, &self.sandbox) {
            Ok(runtime) => {
                *slot = Some(runtime);
                self.counters.restarts.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.ready.store(false, Ordering::Release);
                error!(pattern = %self.source.id, "Failed to recreate pattern instance: {err}");
            }
        }
    }

    /// Release the runtime. Waits for an in-flight call to finish first.
    pub fn dispose(&self) {
        self.ready.store(false, Ordering::Release);
        let mut guard = self.lock_runtime();
        if let Some(mut runtime) = guard.take() {
            runtime.dispose();
            debug!(pattern = %self.source.id, "Pattern instance disposed");
        }
    }

    pub fn stats(&self) -> InstanceStats {
        InstanceStats {
            frames: self.counters.frames.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            budget_overruns: self.counters.budget_overruns.load(Ordering::Relaxed),
            restarts: self.counters.restarts.load(Ordering::Relaxed),
        }
    }

    fn lock_runtime(&self) -> MutexGuard<'_, Option<Box<dyn ScriptRuntime>>> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PatternInstance {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for PatternInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternInstance")
            .field("id", &self.source.id)
            .field("ready", &self.is_ready())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::LIBRARY_SOURCE;

    fn source(body: &str) -> PatternSource {
        PatternSource {
            id: "demo".into(),
            library: Arc::from(LIBRARY_SOURCE),
            source: Arc::from(body),
        }
    }

    fn run(instance: &PatternInstance) -> Vec<EntityData> {
        instance.calculate(&AudioState::default(), &PatternConfig::default(), 1.0 / 60.0)
    }

    #[test]
    fn runtime_error_yields_empty_frame_and_recovers() {
        let instance = PatternInstance::new(
            source(
                r#"
                state.calls = 0
                function calculate(audio, config, dt)
                    state.calls = state.calls + 1
                    if state.calls == 1 then error("first frame explodes") end
                    return { {} }
                end
                "#,
            ),
            SandboxConfig::default(),
        )
        .unwrap();

        assert!(run(&instance).is_empty());
        assert_eq!(run(&instance).len(), 1);
        assert_eq!(instance.stats().failures, 1);
    }

    #[test]
    fn budget_overrun_recreates_from_source() {
        let sandbox = SandboxConfig {
            instruction_budget: 200_000,
            ..SandboxConfig::default()
        };
        let instance = PatternInstance::new(
            source(
                r#"
                state.frames = state.frames or 0
                function calculate(audio, config, dt)
                    state.frames = state.frames + 1
                    if state.frames == 2 then while true do end end
                    return { { id = "f" .. state.frames } }
                end
                "#,
            ),
            sandbox,
        )
        .unwrap();

        assert_eq!(run(&instance)[0].id, "f1");
        assert!(run(&instance).is_empty());
        // fresh state after the restart
        assert_eq!(run(&instance)[0].id, "f1");

        let stats = instance.stats();
        assert_eq!(stats.budget_overruns, 1);
        assert_eq!(stats.restarts, 1);
    }

    #[test]
    fn disposed_instance_returns_nothing() {
        let instance =
            PatternInstance::new(source("function calculate() return { {} } end"), SandboxConfig::default())
                .unwrap();
        assert_eq!(run(&instance).len(), 1);
        instance.dispose();
        assert!(!instance.is_ready());
        assert!(run(&instance).is_empty());
        instance.dispose();
    }

    #[test]
    fn library_helpers_are_available() {
        let instance = PatternInstance::new(
            source(
                r#"
                function calculate(audio, config, dt)
                    local pts = fibonacci_sphere(8)
                    local out = {}
                    for i, p in ipairs(pts) do
                        out[i] = entity("p" .. i, to_unit(p.x), to_unit(p.y), to_unit(p.z), config.base_scale, 0)
                    end
                    return out
                end
                "#,
            ),
            SandboxConfig::default(),
        )
        .unwrap();
        let entities = run(&instance);
        assert_eq!(entities.len(), 8);
        assert!(entities.iter().all(|e| (0.0..=1.0).contains(&e.y)));
    }
}

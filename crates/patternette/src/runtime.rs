//! Script runtime seam and its Lua implementation.

use std::collections::HashMap;
use std::sync::Arc;

use glowproto::{AudioState, EntityData, PatternConfig};
use mlua::{Function, Lua, Value as LuaValue};
use tracing::debug;

use crate::error::ScriptError;
use crate::marshal;
use crate::sandbox::{create_sandboxed_lua, InstructionBudget, SandboxConfig};

/// Inputs for one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameInput<'a> {
    pub audio: &'a AudioState,
    pub config: &'a PatternConfig,
    /// Seconds since the previous frame.
    pub dt: f64,
}

/// An interpreter session that runs pattern code.
///
/// Implementations are driven by one caller at a time; [`PatternInstance`]
/// provides the locking.
///
/// [`PatternInstance`]: crate::instance::PatternInstance
pub trait ScriptRuntime: Send {
    /// Load and run a chunk, defining whatever globals it declares.
    fn compile(&mut self, name: &str, source: &str) -> Result<(), ScriptError>;

    /// Look up a global function and keep it for [`ScriptRuntime::invoke`].
    fn resolve(&mut self, entry: &str) -> Result<(), ScriptError>;

    /// Call a resolved entry point with one frame of input.
    fn invoke(&mut self, entry: &str, input: &FrameInput<'_>)
        -> Result<Vec<EntityData>, ScriptError>;

    /// Release the interpreter. Later calls fail with [`ScriptError::Disposed`].
    fn dispose(&mut self);

    fn is_disposed(&self) -> bool;
}

/// One sandboxed Lua state per pattern instance.
pub struct LuaRuntime {
    name: String,
    lua: Option<Lua>,
    budget: Arc<InstructionBudget>,
    entries: HashMap<String, Function>,
}

impl LuaRuntime {
    /// `name` is the pattern id, used for chunk names and default entity ids.
    pub fn new(name: impl Into<String>, config: &SandboxConfig) -> Result<Self, ScriptError> {
        let budget = Arc::new(InstructionBudget::new(config.instruction_budget));
        let lua = create_sandboxed_lua(config, budget.clone())?;
        Ok(Self {
            name: name.into(),
            lua: Some(lua),
            budget,
            entries: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lua(&self) -> Result<&Lua, ScriptError> {
        self.lua.as_ref().ok_or(ScriptError::Disposed)
    }

    fn budget_error(&self) -> ScriptError {
        ScriptError::BudgetExceeded {
            limit: self.budget.limit(),
        }
    }
}

impl ScriptRuntime for LuaRuntime {
    fn compile(&mut self, name: &str, source: &str) -> Result<(), ScriptError> {
        let lua = self.lua()?;
        self.budget.arm();
        // '=' keeps Lua from quoting the chunk name in error messages
        let result = lua.load(source).set_name(format!("={name}")).exec();
        match result {
            Ok(()) => Ok(()),
            Err(_) if self.budget.is_tripped() => Err(self.budget_error()),
            Err(err) => Err(ScriptError::from_compile(name, err)),
        }
    }

    fn resolve(&mut self, entry: &str) -> Result<(), ScriptError> {
        let function = match self.lua()?.globals().get::<LuaValue>(entry)? {
            LuaValue::Function(function) => function,
            _ => return Err(ScriptError::MissingEntry(entry.to_string())),
        };
        self.entries.insert(entry.to_string(), function);
        Ok(())
    }

    fn invoke(
        &mut self,
        entry: &str,
        input: &FrameInput<'_>,
    ) -> Result<Vec<EntityData>, ScriptError> {
        let lua = self.lua()?;
        let function = self
            .entries
            .get(entry)
            .ok_or_else(|| ScriptError::MissingEntry(entry.to_string()))?;

        let audio = marshal::audio_table(lua, input.audio)?;
        let config = marshal::config_table(lua, input.config)?;

        self.budget.arm();
        let value = match function.call::<LuaValue>((audio, config, input.dt)) {
            Ok(value) => value,
            Err(_) if self.budget.is_tripped() => return Err(self.budget_error()),
            Err(err) => return Err(ScriptError::from_call(err)),
        };

        marshal::read_entities(value, input.config, &self.name)
    }

    fn dispose(&mut self) {
        self.entries.clear();
        if let Some(lua) = self.lua.take() {
            lua.remove_hook();
            drop(lua);
            debug!(pattern = %self.name, "Lua state released");
        }
    }

    fn is_disposed(&self) -> bool {
        self.lua.is_none()
    }
}

impl Drop for LuaRuntime {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(source: &str) -> LuaRuntime {
        let mut rt = LuaRuntime::new("demo", &SandboxConfig::default()).unwrap();
        rt.compile("demo", source).unwrap();
        rt.resolve("calculate").unwrap();
        rt
    }

    fn frame(rt: &mut LuaRuntime) -> Result<Vec<EntityData>, ScriptError> {
        let audio = AudioState::default();
        let config = PatternConfig::default();
        rt.invoke(
            "calculate",
            &FrameInput {
                audio: &audio,
                config: &config,
                dt: 1.0 / 60.0,
            },
        )
    }

    #[test]
    fn invoke_returns_entities() {
        let mut rt = runtime(
            r#"
            function calculate(audio, config, dt)
                return { { x = 0.1, y = 0.2, z = 0.3 }, {} }
            end
            "#,
        );
        let entities = frame(&mut rt).unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[1].id, "demo_1");
    }

    #[test]
    fn state_persists_between_calls() {
        let mut rt = runtime(
            r#"
            state.n = 0
            function calculate(audio, config, dt)
                state.n = state.n + 1
                local out = {}
                for i = 1, state.n do out[i] = {} end
                return out
            end
            "#,
        );
        assert_eq!(frame(&mut rt).unwrap().len(), 1);
        assert_eq!(frame(&mut rt).unwrap().len(), 2);
    }

    #[test]
    fn missing_entry_is_reported() {
        let mut rt = LuaRuntime::new("demo", &SandboxConfig::default()).unwrap();
        rt.compile("demo", "x = 1").unwrap();
        assert!(matches!(
            rt.resolve("calculate"),
            Err(ScriptError::MissingEntry(_))
        ));
    }

    #[test]
    fn syntax_error_is_a_compile_error() {
        let mut rt = LuaRuntime::new("demo", &SandboxConfig::default()).unwrap();
        let err = rt.compile("demo", "function calculate(").unwrap_err();
        assert!(matches!(err, ScriptError::Compile { .. }));
    }

    #[test]
    fn runaway_call_exceeds_budget() {
        let mut rt = LuaRuntime::new(
            "demo",
            &SandboxConfig {
                instruction_budget: 100_000,
                ..SandboxConfig::default()
            },
        )
        .unwrap();
        rt.compile("demo", "function calculate() while true do end end")
            .unwrap();
        rt.resolve("calculate").unwrap();
        assert!(matches!(
            frame(&mut rt),
            Err(ScriptError::BudgetExceeded { .. })
        ));
    }

    #[test]
    fn disposed_runtime_refuses_calls() {
        let mut rt = runtime("function calculate() return {} end");
        rt.dispose();
        assert!(rt.is_disposed());
        assert!(matches!(frame(&mut rt), Err(ScriptError::Disposed)));
    }
}

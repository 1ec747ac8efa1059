//! Sandboxed Lua states.
//!
//! A pattern gets a Lua 5.4 state with only the table, string, math,
//! coroutine and utf8 libraries opened, an allow-list of base functions, a
//! `log` table routed to tracing, a memory cap and an instruction budget.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use glowconf::ScriptingConfig;
use mlua::{
    Function, HookTriggers, Lua, LuaOptions, StdLib, Value as LuaValue, Variadic, VmState,
};

use crate::error::ScriptError;

/// Base globals left in place after the standard libraries are opened.
pub const ALLOWED_GLOBALS: &[&str] = &[
    "_G",
    "_VERSION",
    "assert",
    "error",
    "getmetatable",
    "ipairs",
    "next",
    "pairs",
    "pcall",
    "rawequal",
    "rawget",
    "rawlen",
    "rawset",
    "select",
    "setmetatable",
    "tonumber",
    "tostring",
    "type",
    "xpcall",
    "math",
    "string",
    "table",
    "coroutine",
    "utf8",
];

/// Instructions executed between budget checks.
const HOOK_STRIDE: u32 = 1_000;

const SCRIPT_TARGET: &str = "patternette.script";

/// Limits applied to every pattern state.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    /// VM instructions allowed per call.
    pub instruction_budget: u64,
    /// Heap cap for the whole state, in bytes.
    pub memory_limit: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::from(&ScriptingConfig::default())
    }
}

impl From<&ScriptingConfig> for SandboxConfig {
    fn from(config: &ScriptingConfig) -> Self {
        Self {
            instruction_budget: config.instruction_budget,
            memory_limit: config.memory_limit_bytes,
        }
    }
}

/// Per-state instruction counter, re-armed before every call into Lua.
#[derive(Debug)]
pub struct InstructionBudget {
    limit: u64,
    used: AtomicU64,
    tripped: AtomicBool,
}

impl InstructionBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit: limit.max(HOOK_STRIDE as u64),
            used: AtomicU64::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn arm(&self) {
        self.used.store(0, Ordering::Relaxed);
        self.tripped.store(false, Ordering::Relaxed);
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Relaxed)
    }

    /// Charge one hook stride. Returns false once the budget is spent.
    fn charge(&self) -> bool {
        let used = self.used.fetch_add(HOOK_STRIDE as u64, Ordering::Relaxed) + HOOK_STRIDE as u64;
        if used > self.limit {
            self.tripped.store(true, Ordering::Relaxed);
            return false;
        }
        true
    }
}

/// Create a Lua state for one pattern.
///
/// The state carries an empty global `state` table for the pattern's own
/// persistent data.
pub fn create_sandboxed_lua(
    config: &SandboxConfig,
    budget: Arc<InstructionBudget>,
) -> Result<Lua, ScriptError> {
    let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::COROUTINE | StdLib::UTF8;
    let lua = Lua::new_with(libs, LuaOptions::default())
        .map_err(|e| ScriptError::Setup(e.to_string()))?;

    remove_unlisted_globals(&lua)?;
    register_log(&lua)?;
    register_guarded_pcall(&lua, budget.clone())?;
    register_guarded_setmetatable(&lua)?;
    lua.globals().set("state", lua.create_table()?)?;

    lua.set_memory_limit(config.memory_limit)
        .map_err(|e| ScriptError::Setup(e.to_string()))?;

    let hook_budget = budget;
    let _ = lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_STRIDE),
        move |_lua, _debug| {
            if hook_budget.charge() {
                Ok(VmState::Continue)
            } else {
                Err(mlua::Error::RuntimeError(format!(
                    "instruction budget of {} exceeded",
                    hook_budget.limit()
                )))
            }
        },
    );

    Ok(lua)
}

fn remove_unlisted_globals(lua: &Lua) -> Result<(), ScriptError> {
    let globals = lua.globals();
    let mut doomed = Vec::new();
    for pair in globals.pairs::<LuaValue, LuaValue>() {
        let (key, _) = pair?;
        if let LuaValue::String(name) = &key {
            if ALLOWED_GLOBALS.contains(&name.to_string_lossy().as_str()) {
                continue;
            }
        }
        doomed.push(key);
    }
    for key in doomed {
        globals.raw_set(key, LuaValue::Nil)?;
    }
    Ok(())
}

/// `log.info/warn/error/debug` plus a `print` that goes to debug logs.
fn register_log(lua: &Lua) -> Result<(), ScriptError> {
    let log_table = lua.create_table()?;

    let log_info = lua.create_function(|_, msg: Variadic<LuaValue>| {
        tracing::info!(target: SCRIPT_TARGET, "{}", join_values(&msg));
        Ok(())
    })?;
    let log_warn = lua.create_function(|_, msg: Variadic<LuaValue>| {
        tracing::warn!(target: SCRIPT_TARGET, "{}", join_values(&msg));
        Ok(())
    })?;
    let log_error = lua.create_function(|_, msg: Variadic<LuaValue>| {
        tracing::error!(target: SCRIPT_TARGET, "{}", join_values(&msg));
        Ok(())
    })?;
    let log_debug = lua.create_function(|_, msg: Variadic<LuaValue>| {
        tracing::debug!(target: SCRIPT_TARGET, "{}", join_values(&msg));
        Ok(())
    })?;

    log_table.set("info", log_info)?;
    log_table.set("warn", log_warn)?;
    log_table.set("error", log_error)?;
    log_table.set("debug", log_debug.clone())?;

    let globals = lua.globals();
    globals.set("log", log_table)?;
    globals.set("print", log_debug)?;
    Ok(())
}

fn join_values(values: &[LuaValue]) -> String {
    values
        .iter()
        .map(describe_value)
        .collect::<Vec<_>>()
        .join("\t")
}

fn describe_value(value: &LuaValue) -> String {
    match value {
        LuaValue::Nil => "nil".to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        LuaValue::String(s) => s.to_string_lossy(),
        other => other.type_name().to_string(),
    }
}

/// Wraps `pcall`/`xpcall` so a spent budget cannot be swallowed by a
/// script that keeps catching the budget error. Ordinary error values pass
/// through untouched and the wrappers stay yieldable.
const GUARDED_PCALL: &str = r#"
local raw_pcall, raw_xpcall, tripped = ...
local error = error

local function rethrow_if_tripped(ok, ...)
    if not ok and tripped() then
        error((...), 0)
    end
    return ok, ...
end

pcall = function(f, ...)
    return rethrow_if_tripped(raw_pcall(f, ...))
end

xpcall = function(f, handler, ...)
    return rethrow_if_tripped(raw_xpcall(f, handler, ...))
end
"#;

fn register_guarded_pcall(lua: &Lua, budget: Arc<InstructionBudget>) -> Result<(), ScriptError> {
    let globals = lua.globals();
    let raw_pcall: Function = globals.get("pcall")?;
    let raw_xpcall: Function = globals.get("xpcall")?;
    let tripped = lua.create_function(move |_, ()| Ok(budget.is_tripped()))?;

    lua.load(GUARDED_PCALL)
        .set_name("=sandbox")
        .call::<()>((raw_pcall, raw_xpcall, tripped))?;
    Ok(())
}

/// Finalizers run with hooks disabled, out of the budget's reach, so a
/// metatable carrying `__gc` is refused. Lua only registers a finalizer when
/// `__gc` is present at `setmetatable` time.
fn register_guarded_setmetatable(lua: &Lua) -> Result<(), ScriptError> {
    let globals = lua.globals();
    let raw_setmetatable: Function = globals.get("setmetatable")?;
    let guarded = lua.create_function(move |_, (target, meta): (LuaValue, LuaValue)| {
        if let LuaValue::Table(meta) = &meta {
            if !meta.raw_get::<LuaValue>("__gc")?.is_nil() {
                return Err(mlua::Error::runtime(
                    "setmetatable: __gc metamethods are not allowed",
                ));
            }
        }
        raw_setmetatable.call::<LuaValue>((target, meta))
    })?;
    globals.set("setmetatable", guarded)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(budget: u64) -> (Lua, Arc<InstructionBudget>) {
        let budget = Arc::new(InstructionBudget::new(budget));
        let config = SandboxConfig {
            instruction_budget: budget.limit(),
            memory_limit: 16 * 1024 * 1024,
        };
        let lua = create_sandboxed_lua(&config, budget.clone()).unwrap();
        (lua, budget)
    }

    #[test]
    fn dangerous_globals_are_absent() {
        let (lua, _) = sandbox(1_000_000);
        for name in [
            "io", "os", "package", "require", "debug", "dofile", "loadfile", "load",
            "collectgarbage",
        ] {
            let value: LuaValue = lua.globals().get(name).unwrap();
            assert!(value.is_nil(), "{name} should not be reachable");
        }
    }

    #[test]
    fn allowed_libraries_work() {
        let (lua, _) = sandbox(1_000_000);
        let result: String = lua
            .load(r#"return string.upper("ok") .. table.concat({1, 2}, ",") .. math.floor(2.7)"#)
            .eval()
            .unwrap();
        assert_eq!(result, "OK1,22");
    }

    #[test]
    fn state_table_exists() {
        let (lua, _) = sandbox(1_000_000);
        let kind: String = lua.load("return type(state)").eval().unwrap();
        assert_eq!(kind, "table");
    }

    #[test]
    fn infinite_loop_hits_budget() {
        let (lua, budget) = sandbox(50_000);
        budget.arm();
        let result = lua.load("while true do end").exec();
        assert!(result.is_err());
        assert!(budget.is_tripped());
    }

    #[test]
    fn pcall_cannot_swallow_budget() {
        let (lua, budget) = sandbox(50_000);
        budget.arm();
        let result = lua
            .load("while true do pcall(function() while true do end end) end")
            .exec();
        assert!(result.is_err());
        assert!(budget.is_tripped());
    }

    #[test]
    fn pcall_still_catches_ordinary_errors() {
        let (lua, budget) = sandbox(1_000_000);
        budget.arm();
        let (ok, message): (bool, String) = lua
            .load(r#"return pcall(function() error("nope", 0) end)"#)
            .eval()
            .unwrap();
        assert!(!ok);
        assert_eq!(message, "nope");
    }

    #[test]
    fn pcall_keeps_table_error_values() {
        let (lua, budget) = sandbox(1_000_000);
        budget.arm();
        let (ok, code): (bool, i64) = lua
            .load("local ok, err = pcall(error, { code = 7 }) return ok, err.code")
            .eval()
            .unwrap();
        assert!(!ok);
        assert_eq!(code, 7);
    }

    #[test]
    fn coroutines_can_yield_through_pcall() {
        let (lua, budget) = sandbox(1_000_000);
        budget.arm();
        let (first, second): (i64, i64) = lua
            .load(
                r#"
                local co = coroutine.wrap(function()
                    pcall(function() coroutine.yield(1) end)
                    return 2
                end)
                return co(), co()
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!((first, second), (1, 2));
    }

    #[test]
    fn finalizers_are_refused() {
        let (lua, budget) = sandbox(1_000_000);
        budget.arm();
        let err = lua
            .load("setmetatable({}, { __gc = function() while true do end end })")
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("__gc"));
    }

    #[test]
    fn other_metatables_still_work() {
        let (lua, budget) = sandbox(1_000_000);
        budget.arm();
        let value: i64 = lua
            .load("local t = setmetatable({}, { __index = function() return 42 end }) return t.x")
            .eval()
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn memory_cap_is_enforced() {
        let budget = Arc::new(InstructionBudget::new(u64::MAX));
        let config = SandboxConfig {
            instruction_budget: u64::MAX,
            memory_limit: 1024 * 1024,
        };
        let lua = create_sandboxed_lua(&config, budget.clone()).unwrap();
        budget.arm();
        let result = lua
            .load("local t = {} for i = 1, 1e8 do t[i] = string.rep('x', 64) .. i end")
            .exec();
        assert!(result.is_err());
    }
}

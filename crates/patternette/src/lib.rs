//! Patternette - sandboxed Lua pattern host
//!
//! Runs small animation scripts ("patterns") every frame: audio features in,
//! positioned entities out.
//!
//! # Overview
//!
//! Each pattern lives in its own Lua 5.4 state with the shared helper
//! library loaded first. Only an allow-list of globals is visible, calls run
//! under an instruction budget and a memory cap, and a failing frame yields
//! no entities instead of an error.
//!
//! - [`PatternCatalog`]: known patterns, built-in and from a directory
//! - [`PatternInstance`]: one live pattern with its private `state` table
//! - [`DeferredPattern`]: a handle that renders nothing until its instance is built
//! - [`PatternHost`]: zone to pattern bindings

pub mod catalog;
pub mod deferred;
pub mod error;
pub mod host;
pub mod instance;
pub mod marshal;
pub mod runtime;
pub mod sandbox;

pub use catalog::{PatternCatalog, PatternMeta, LIBRARY_SOURCE};
pub use deferred::DeferredPattern;
pub use error::{ScriptError, ScriptErrorKind};
pub use host::PatternHost;
pub use instance::{
    lua_builder, InstanceStats, PatternInstance, PatternSource, RuntimeBuilder, ENTRY_POINT,
};
pub use runtime::{FrameInput, LuaRuntime, ScriptRuntime};
pub use sandbox::SandboxConfig;

//! Script failures and their classification.
//!
//! Every failure inside a pattern ends at the call boundary as a
//! [`ScriptError`]. Callers mostly log it and move on; [`ScriptErrorKind`]
//! gives the log line a stable category and a hint for pattern authors.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to set up Lua state: {0}")]
    Setup(String),

    #[error("failed to compile {chunk}: {message}")]
    Compile { chunk: String, message: String },

    #[error("pattern does not define a {0}() function")]
    MissingEntry(String),

    #[error("script error: {0}")]
    Runtime(String),

    #[error("instruction budget of {limit} exceeded")]
    BudgetExceeded { limit: u64 },

    #[error("memory limit exceeded: {0}")]
    OutOfMemory(String),

    #[error("calculate() returned {0}, expected a table of entities")]
    BadReturn(String),

    #[error("pattern instance has been disposed")]
    Disposed,

    #[error("unknown pattern '{0}'")]
    UnknownPattern(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

/// Categories used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptErrorKind {
    Syntax,
    Runtime,
    NilCall,
    MissingEntry,
    Budget,
    Memory,
    Lifecycle,
    Catalog,
}

impl ScriptErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptErrorKind::Syntax => "syntax",
            ScriptErrorKind::Runtime => "runtime",
            ScriptErrorKind::NilCall => "nil_call",
            ScriptErrorKind::MissingEntry => "missing_entry",
            ScriptErrorKind::Budget => "budget",
            ScriptErrorKind::Memory => "memory",
            ScriptErrorKind::Lifecycle => "lifecycle",
            ScriptErrorKind::Catalog => "catalog",
        }
    }

    /// One-line advice for the pattern author.
    pub fn hint(&self) -> &'static str {
        match self {
            ScriptErrorKind::Syntax => "check for missing 'end', unbalanced brackets or stray symbols",
            ScriptErrorKind::Runtime => "the pattern raised an error while computing a frame",
            ScriptErrorKind::NilCall => {
                "a function or table is nil; check spelling and that io/os/require are not used"
            }
            ScriptErrorKind::MissingEntry => "define a global function calculate(audio, config, dt)",
            ScriptErrorKind::Budget => "the frame ran too long; look for unbounded loops",
            ScriptErrorKind::Memory => "the pattern allocated too much; trim what it keeps in state",
            ScriptErrorKind::Lifecycle => "the instance was disposed or never became ready",
            ScriptErrorKind::Catalog => "check the pattern id and pattern directory",
        }
    }
}

impl std::fmt::Display for ScriptErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ScriptError {
    pub fn kind(&self) -> ScriptErrorKind {
        match self {
            ScriptError::Setup(_) | ScriptError::Disposed => ScriptErrorKind::Lifecycle,
            ScriptError::Compile { message, .. } => {
                if is_syntax_message(message) {
                    ScriptErrorKind::Syntax
                } else {
                    detect_runtime_kind(message)
                }
            }
            ScriptError::MissingEntry(_) => ScriptErrorKind::MissingEntry,
            ScriptError::Runtime(message) | ScriptError::BadReturn(message) => {
                detect_runtime_kind(message)
            }
            ScriptError::BudgetExceeded { .. } => ScriptErrorKind::Budget,
            ScriptError::OutOfMemory(_) => ScriptErrorKind::Memory,
            ScriptError::UnknownPattern(_) | ScriptError::Io { .. } => ScriptErrorKind::Catalog,
            ScriptError::Lua(err) => match err {
                mlua::Error::SyntaxError { .. } => ScriptErrorKind::Syntax,
                mlua::Error::MemoryError(_) => ScriptErrorKind::Memory,
                other => detect_runtime_kind(&other.to_string()),
            },
        }
    }

    /// Map an error raised by Lua code, with the budget and memory cases
    /// already decided by the caller.
    pub(crate) fn from_call(err: mlua::Error) -> Self {
        if is_memory_error(&err) {
            return ScriptError::OutOfMemory(err.to_string());
        }
        ScriptError::Runtime(clean_message(&err.to_string()))
    }

    pub(crate) fn from_compile(chunk: &str, err: mlua::Error) -> Self {
        if is_memory_error(&err) {
            return ScriptError::OutOfMemory(err.to_string());
        }
        let message = match &err {
            mlua::Error::SyntaxError { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ScriptError::Compile {
            chunk: chunk.to_string(),
            message: clean_message(&message),
        }
    }
}

fn is_memory_error(err: &mlua::Error) -> bool {
    match err {
        mlua::Error::MemoryError(_) => true,
        mlua::Error::CallbackError { cause, .. } => is_memory_error(cause),
        _ => false,
    }
}

fn is_syntax_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("syntax error")
        || lower.contains("unexpected symbol")
        || lower.contains("expected near")
        || lower.contains("unfinished string")
        || lower.contains("'end' expected")
}

fn detect_runtime_kind(message: &str) -> ScriptErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("attempt to call a nil value") || lower.contains("attempt to index a nil value")
    {
        ScriptErrorKind::NilCall
    } else if lower.contains("not enough memory") {
        ScriptErrorKind::Memory
    } else {
        ScriptErrorKind::Runtime
    }
}

/// First line of a Lua error without the traceback mlua appends.
fn clean_message(message: &str) -> String {
    message
        .lines()
        .take_while(|line| !line.trim_start().starts_with("stack traceback:"))
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_errors_classify_as_syntax() {
        let err = ScriptError::Compile {
            chunk: "spiral".into(),
            message: "[string \"spiral\"]:3: 'end' expected near <eof>".into(),
        };
        assert_eq!(err.kind(), ScriptErrorKind::Syntax);
    }

    #[test]
    fn nil_calls_are_recognised() {
        let err = ScriptError::Runtime("spiral:4: attempt to call a nil value (global 'nope')".into());
        assert_eq!(err.kind(), ScriptErrorKind::NilCall);
        assert!(err.kind().hint().contains("nil"));
    }

    #[test]
    fn traceback_is_stripped() {
        let cleaned = clean_message("boom:1: bad\nstack traceback:\n\t[C]: in ?");
        assert_eq!(cleaned, "boom:1: bad");
    }

    #[test]
    fn budget_and_lifecycle_kinds() {
        assert_eq!(
            ScriptError::BudgetExceeded { limit: 10 }.kind(),
            ScriptErrorKind::Budget
        );
        assert_eq!(ScriptError::Disposed.kind(), ScriptErrorKind::Lifecycle);
        assert_eq!(
            ScriptError::UnknownPattern("x".into()).kind(),
            ScriptErrorKind::Catalog
        );
    }
}

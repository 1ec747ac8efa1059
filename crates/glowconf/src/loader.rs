//! Config file discovery, loading, merging and environment variable overlay.

use crate::{ConfigError, GlowConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Provenance of a loaded configuration, for startup logging.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Files merged, lowest precedence first.
    pub files: Vec<PathBuf>,
    /// Names of `GLOW_*` and standard variables that took effect.
    pub env_overrides: Vec<String>,
}

/// Existing config files, lowest precedence first: `/etc/glow/config.toml`,
/// the user config dir, then `./glow.toml`.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Like [`discover_config_files`], but an existing `explicit` path takes
/// the place of `./glow.toml`.
pub fn discover_config_files_with_override(explicit: Option<&Path>) -> Vec<PathBuf> {
    let user = directories::BaseDirs::new().map(|dirs| dirs.config_dir().join("glow/config.toml"));
    let last = match explicit {
        Some(path) if path.exists() => path.to_path_buf(),
        _ => PathBuf::from("glow.toml"),
    };

    [Some(PathBuf::from("/etc/glow/config.toml")), user, Some(last)]
        .into_iter()
        .flatten()
        .filter(|path| path.exists())
        .collect()
}

/// Read a TOML file into a raw table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`, recursing into tables. Non-table values
/// (including arrays of zones) are replaced wholesale.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Overlay `GLOW_*` variables (plus `OTEL_EXPORTER_OTLP_ENDPOINT` and
/// `RUST_LOG`) onto a merged config, recording each one that applied.
pub fn apply_env_overrides(config: &mut GlowConfig, sources: &mut ConfigSources) {
    let infra = &mut config.infra;
    let mut seen = |name: &str| sources.env_overrides.push(name.to_string());

    if let Ok(host) = env::var("GLOW_HOST") {
        infra.bind.host = host;
        seen("GLOW_HOST");
    }
    if let Some(port) = parsed_var("GLOW_PORT") {
        infra.bind.port = port;
        seen("GLOW_PORT");
    }
    if let Some(ms) = parsed_var("GLOW_HEARTBEAT_INTERVAL_MS") {
        infra.heartbeat.interval_ms = ms;
        seen("GLOW_HEARTBEAT_INTERVAL_MS");
    }
    if let Some(ms) = parsed_var("GLOW_HEARTBEAT_TIMEOUT_MS") {
        infra.heartbeat.timeout_ms = ms;
        seen("GLOW_HEARTBEAT_TIMEOUT_MS");
    }
    if let Some(capacity) = parsed_var("GLOW_QUEUE_CAPACITY") {
        infra.queue.capacity = capacity;
        seen("GLOW_QUEUE_CAPACITY");
    }
    if let Some(budget) = parsed_var("GLOW_INSTRUCTION_BUDGET") {
        infra.scripting.instruction_budget = budget;
        seen("GLOW_INSTRUCTION_BUDGET");
    }
    if let Ok(dir) = env::var("GLOW_PATTERN_DIR") {
        infra.scripting.pattern_dir = Some(PathBuf::from(dir));
        seen("GLOW_PATTERN_DIR");
    }

    // the OTEL name wins over GLOW_OTLP_ENDPOINT, RUST_LOG over GLOW_LOG_LEVEL
    for name in ["GLOW_OTLP_ENDPOINT", "OTEL_EXPORTER_OTLP_ENDPOINT"] {
        if let Ok(endpoint) = env::var(name) {
            infra.telemetry.otlp_endpoint = Some(endpoint);
            seen(name);
        }
    }
    for name in ["GLOW_LOG_LEVEL", "RUST_LOG"] {
        if let Ok(level) = env::var(name) {
            infra.telemetry.log_level = level;
            seen(name);
        }
    }

    if let Some(dir) = infra.scripting.pattern_dir.take() {
        infra.scripting.pattern_dir = Some(expand_path(&dir.to_string_lossy()));
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Resolve a leading `~/` or `$VAR` in a configured path. Unresolvable
/// prefixes are left as written.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        return match directories::BaseDirs::new() {
            Some(dirs) => dirs.home_dir().join(rest),
            None => PathBuf::from(path),
        };
    }

    let Some(rest) = path.strip_prefix('$') else {
        return PathBuf::from(path);
    };
    let (name, tail) = rest.split_once('/').unwrap_or((rest, ""));
    match env::var(name) {
        Ok(value) if tail.is_empty() => PathBuf::from(value),
        Ok(value) => Path::new(&value).join(tail),
        Err(_) => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_home_prefix_is_expanded() {
        let expanded = expand_path("~/patterns/extra");
        assert!(expanded.ends_with("patterns/extra"));
        assert!(!expanded.starts_with("~"));
    }

    #[test]
    fn test_plain_and_unknown_var_paths_are_kept() {
        assert_eq!(expand_path("/srv/glow"), PathBuf::from("/srv/glow"));
        assert_eq!(
            expand_path("$GLOW_SURELY_UNSET_VAR/x"),
            PathBuf::from("$GLOW_SURELY_UNSET_VAR/x")
        );
    }

    #[test]
    fn test_explicit_file_replaces_local_override() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let files = discover_config_files_with_override(Some(file.path()));
        assert_eq!(files.last().map(PathBuf::as_path), Some(file.path()));
        assert!(!files.iter().any(|p| p == Path::new("glow.toml")));
    }

    #[test]
    fn test_merge_tables_recurses() {
        let mut base: toml::Table = "[bind]\nhost = \"127.0.0.1\"\nport = 1\n".parse().unwrap();
        let overlay: toml::Table = "[bind]\nport = 2\n[queue]\ncapacity = 8\n".parse().unwrap();

        merge_tables(&mut base, overlay);

        let bind = base["bind"].as_table().unwrap();
        assert_eq!(bind["host"].as_str(), Some("127.0.0.1"));
        assert_eq!(bind["port"].as_integer(), Some(2));
        assert_eq!(base["queue"]["capacity"].as_integer(), Some(8));
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[limits]
max_frame_bytes = 1024

[[bootstrap.zones]]
id = "stage"
pattern = "spiral"
entity_count = 12
"#
        )
        .unwrap();

        let (config, sources) = GlowConfig::load_with_sources_from(Some(file.path())).unwrap();

        assert!(sources.files.iter().any(|p| p == file.path()));
        assert_eq!(config.infra.limits.max_frame_bytes, 1024);
        assert_eq!(config.bootstrap.zones.len(), 1);
        assert_eq!(config.bootstrap.zones[0].id, "stage");
        assert_eq!(config.bootstrap.zones[0].entity_count, Some(12));
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[bind\nport = ").unwrap();

        let err = load_table(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}

//! Registry of known patterns.
//!
//! Patterns are Lua sources with a small header of `-- @key: value`
//! comments describing them:
//!
//! ```lua
//! -- @name: Spiral
//! -- @description: A rotating spiral arm
//! -- @category: geometric
//! -- @static_camera: false
//! -- @count: 64
//! ```
//!
//! The built-in set is compiled into the binary; more can be loaded from a
//! directory of `*.lua` files, which override built-ins with the same id.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use glowproto::PatternSummary;
use tracing::{debug, info, warn};

use crate::error::ScriptError;
use crate::instance::{PatternInstance, PatternSource};
use crate::sandbox::SandboxConfig;

/// Shared helpers loaded ahead of every pattern.
pub const LIBRARY_SOURCE: &str = include_str!("lua/lib.lua");

const BUILTIN_SOURCES: &[(&str, &str)] = &[
    ("spectrum_bars", include_str!("lua/patterns/spectrum_bars.lua")),
    ("spiral", include_str!("lua/patterns/spiral.lua")),
    ("pulse_sphere", include_str!("lua/patterns/pulse_sphere.lua")),
    ("particle_fountain", include_str!("lua/patterns/particle_fountain.lua")),
    ("wave_grid", include_str!("lua/patterns/wave_grid.lua")),
    ("orbit_rings", include_str!("lua/patterns/orbit_rings.lua")),
];

const DEFAULT_CATEGORY: &str = "custom";
const DEFAULT_COUNT: u32 = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct PatternMeta {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub static_camera: bool,
    pub suggested_count: u32,
    pub source: Arc<str>,
}

impl PatternMeta {
    /// Build metadata from a source's header comments.
    pub fn from_source(id: impl Into<String>, source: impl Into<Arc<str>>) -> Self {
        let id = id.into();
        let source = source.into();
        let mut meta = Self {
            name: display_name(&id),
            description: String::new(),
            category: DEFAULT_CATEGORY.to_string(),
            static_camera: false,
            suggested_count: DEFAULT_COUNT,
            id,
            source: source.clone(),
        };

        for line in source.lines().map(str::trim) {
            if line.is_empty() {
                continue;
            }
            let Some(comment) = line.strip_prefix("--") else {
                break;
            };
            let Some(tag) = comment.trim_start().strip_prefix('@') else {
                continue;
            };
            let (key, value) = match tag.split_once(|c: char| c == ':' || c.is_whitespace()) {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (tag.trim(), ""),
            };
            meta.apply_tag(key, value);
        }
        meta
    }

    fn apply_tag(&mut self, key: &str, value: &str) {
        match key {
            "name" if !value.is_empty() => self.name = value.to_string(),
            "description" => self.description = value.to_string(),
            "category" if !value.is_empty() => self.category = value.to_string(),
            "static_camera" => {
                self.static_camera = matches!(value.to_ascii_lowercase().as_str(), "" | "true" | "yes" | "1")
            }
            "count" => match value.parse() {
                Ok(count) => self.suggested_count = count,
                Err(_) => warn!(pattern = %self.id, value, "Ignoring bad @count"),
            },
            _ => {}
        }
    }

    pub fn summary(&self) -> PatternSummary {
        PatternSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            category: self.category.clone(),
            static_camera: self.static_camera,
            suggested_count: self.suggested_count,
        }
    }
}

/// "pulse_sphere" -> "Pulse Sphere"
fn display_name(id: &str) -> String {
    id.split(['_', '-'])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pattern metadata and sources, keyed by id. Read-mostly; share it behind
/// an `Arc` once populated.
#[derive(Debug, Clone)]
pub struct PatternCatalog {
    library: Arc<str>,
    patterns: BTreeMap<String, PatternMeta>,
}

impl Default for PatternCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PatternCatalog {
    pub fn empty() -> Self {
        Self {
            library: Arc::from(LIBRARY_SOURCE),
            patterns: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        for (id, source) in BUILTIN_SOURCES {
            catalog.register(PatternMeta::from_source(*id, *source));
        }
        catalog
    }

    /// Add or replace a pattern, returning the one it replaced.
    pub fn register(&mut self, meta: PatternMeta) -> Option<PatternMeta> {
        self.patterns.insert(meta.id.clone(), meta)
    }

    /// Register every `*.lua` file in `dir`, using the file stem as id.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, ScriptError> {
        let io_err = |source| ScriptError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths = std::fs::read_dir(dir)
            .map_err(io_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "lua"))
            .collect::<Vec<_>>();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                warn!(path = %path.display(), "Skipping pattern with non UTF-8 name");
                continue;
            };
            let source = std::fs::read_to_string(&path).map_err(|source| ScriptError::Io {
                path: path.clone(),
                source,
            })?;
            if self.register(PatternMeta::from_source(id.clone(), source)).is_some() {
                info!(pattern = %id, path = %path.display(), "Pattern file overrides existing pattern");
            } else {
                debug!(pattern = %id, path = %path.display(), "Loaded pattern file");
            }
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn get(&self, id: &str) -> Option<&PatternMeta> {
        self.patterns.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.patterns.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Patterns in id order.
    pub fn list(&self) -> impl Iterator<Item = &PatternMeta> {
        self.patterns.values()
    }

    pub fn summaries(&self) -> Vec<PatternSummary> {
        self.list().map(PatternMeta::summary).collect()
    }

    pub fn source(&self, id: &str) -> Result<PatternSource, ScriptError> {
        let meta = self
            .get(id)
            .ok_or_else(|| ScriptError::UnknownPattern(id.to_string()))?;
        Ok(PatternSource {
            id: meta.id.clone(),
            library: self.library.clone(),
            source: meta.source.clone(),
        })
    }

    /// Build a ready instance on the calling thread.
    pub fn instantiate(
        &self,
        id: &str,
        sandbox: &SandboxConfig,
    ) -> Result<PatternInstance, ScriptError> {
        PatternInstance::new(self.source(id)?, sandbox.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_tags_are_parsed() {
        let meta = PatternMeta::from_source(
            "my_thing",
            "-- @name: Thing\n-- @category: test\n-- @static_camera\n-- @count: 12\n\nfunction calculate() end\n-- @name: ignored",
        );
        assert_eq!(meta.name, "Thing");
        assert_eq!(meta.category, "test");
        assert!(meta.static_camera);
        assert_eq!(meta.suggested_count, 12);
    }

    #[test]
    fn missing_header_uses_defaults() {
        let meta = PatternMeta::from_source("pulse_sphere", "function calculate() end");
        assert_eq!(meta.name, "Pulse Sphere");
        assert_eq!(meta.category, DEFAULT_CATEGORY);
        assert_eq!(meta.suggested_count, DEFAULT_COUNT);
        assert!(!meta.static_camera);
    }

    #[test]
    fn builtins_are_listed_in_id_order() {
        let catalog = PatternCatalog::builtin();
        let ids: Vec<_> = catalog.list().map(|m| m.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "orbit_rings",
                "particle_fountain",
                "pulse_sphere",
                "spectrum_bars",
                "spiral",
                "wave_grid"
            ]
        );
        let bars = catalog.get("spectrum_bars").unwrap();
        assert_eq!(bars.name, "Spectrum Bars");
        assert!(bars.static_camera);
        assert_eq!(bars.suggested_count, 40);
    }

    #[test]
    fn unknown_pattern_is_an_error() {
        let catalog = PatternCatalog::builtin();
        assert!(matches!(
            catalog.source("nope"),
            Err(ScriptError::UnknownPattern(_))
        ));
    }

    #[test]
    fn load_dir_adds_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("glitter.lua"),
            "-- @name: Glitter\nfunction calculate() return {} end\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("spiral.lua"),
            "-- @name: My Spiral\nfunction calculate() return {} end\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a pattern").unwrap();

        let mut catalog = PatternCatalog::builtin();
        let before = catalog.len();
        assert_eq!(catalog.load_dir(dir.path()).unwrap(), 2);
        assert_eq!(catalog.len(), before + 1);
        assert_eq!(catalog.get("spiral").unwrap().name, "My Spiral");
        assert!(catalog.contains("glitter"));
    }

    #[test]
    fn load_dir_reports_missing_directory() {
        let mut catalog = PatternCatalog::empty();
        let err = catalog
            .load_dir(Path::new("/definitely/not/here"))
            .unwrap_err();
        assert!(matches!(err, ScriptError::Io { .. }));
    }
}

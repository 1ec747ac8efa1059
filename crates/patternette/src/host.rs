//! Zone to pattern bindings.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use glowproto::{AudioState, EntityData, PatternConfig};
use tracing::info;

use crate::catalog::PatternCatalog;
use crate::deferred::DeferredPattern;
use crate::error::ScriptError;
use crate::sandbox::SandboxConfig;

#[derive(Clone)]
struct Binding {
    pattern: String,
    deferred: Arc<DeferredPattern>,
}

/// Holds one deferred pattern per zone. Replacing or removing a zone's
/// pattern disposes the old instance.
pub struct PatternHost {
    catalog: Arc<PatternCatalog>,
    sandbox: SandboxConfig,
    zones: RwLock<HashMap<String, Binding>>,
}

impl PatternHost {
    pub fn new(catalog: Arc<PatternCatalog>, sandbox: SandboxConfig) -> Self {
        Self {
            catalog,
            sandbox,
            zones: RwLock::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<PatternCatalog> {
        &self.catalog
    }

    /// Bind `pattern` to `zone`. The instance starts building in the
    /// background; the zone renders empty frames until it is ready.
    pub fn activate(&self, zone: &str, pattern: &str) -> Result<Arc<DeferredPattern>, ScriptError> {
        let source = self.catalog.source(pattern)?;
        let deferred = DeferredPattern::spawn(source, self.sandbox.clone());

        let previous = self
            .zones
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                zone.to_string(),
                Binding {
                    pattern: pattern.to_string(),
                    deferred: deferred.clone(),
                },
            );

        match previous {
            Some(old) => {
                old.deferred.dispose();
                info!(zone, from = %old.pattern, to = pattern, "Zone pattern replaced");
            }
            None => info!(zone, pattern, "Zone pattern activated"),
        }
        Ok(deferred)
    }

    pub fn deactivate(&self, zone: &str) -> bool {
        let removed = self
            .zones
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(zone);
        match removed {
            Some(old) => {
                old.deferred.dispose();
                info!(zone, pattern = %old.pattern, "Zone pattern deactivated");
                true
            }
            None => false,
        }
    }

    pub fn active_pattern(&self, zone: &str) -> Option<String> {
        self.binding(zone).map(|b| b.pattern)
    }

    pub fn get(&self, zone: &str) -> Option<Arc<DeferredPattern>> {
        self.binding(zone).map(|b| b.deferred)
    }

    /// Run one frame for a zone. Zones without a pattern render nothing.
    pub fn calculate(
        &self,
        zone: &str,
        audio: &AudioState,
        config: &PatternConfig,
        dt: f64,
    ) -> Vec<EntityData> {
        match self.get(zone) {
            Some(deferred) => deferred.calculate(audio, config, dt),
            None => Vec::new(),
        }
    }

    /// Zones with a bound pattern, sorted.
    pub fn zones(&self) -> Vec<String> {
        let mut zones: Vec<String> = self
            .zones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        zones.sort();
        zones
    }

    pub fn dispose_all(&self) {
        let drained: Vec<Binding> = self
            .zones
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, binding)| binding)
            .collect();
        for binding in drained {
            binding.deferred.dispose();
        }
    }

    fn binding(&self, zone: &str) -> Option<Binding> {
        self.zones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(zone)
            .cloned()
    }
}

impl Drop for PatternHost {
    fn drop(&mut self) {
        self.dispose_all();
    }
}

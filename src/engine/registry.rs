//! Engine registry: backend name -> factory
//!
//! Built once at startup and handed to the node; nothing here is global.

use crate::common::{Clock, Error, Result, SystemClock};
use crate::engine::{Engine, FsEngine, MemoryEngine, SledEngine, SqliteEngine};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a backend needs to open its store
#[derive(Clone)]
pub struct EngineOptions {
    pub path: PathBuf,
    pub clock: Arc<dyn Clock>,
    /// Flush to disk before acknowledging writes
    pub sync_writes: bool,
}

impl EngineOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            clock: Arc::new(SystemClock),
            sync_writes: true,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }
}

impl fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineOptions")
            .field("path", &self.path)
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

pub type EngineFactory = Arc<dyn Fn(&EngineOptions) -> Result<Arc<dyn Engine>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct EngineRegistry {
    factories: BTreeMap<String, EngineFactory>,
}

impl EngineRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled backends: `sled`, `sqlite`, `filesystem`, `memory`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(
            "sled".into(),
            Arc::new(|opts: &EngineOptions| {
                Ok(Arc::new(SledEngine::open(opts)?) as Arc<dyn Engine>)
            }),
        );
        registry.factories.insert(
            "sqlite".into(),
            Arc::new(|opts: &EngineOptions| {
                Ok(Arc::new(SqliteEngine::open(opts)?) as Arc<dyn Engine>)
            }),
        );
        registry.factories.insert(
            "filesystem".into(),
            Arc::new(|opts: &EngineOptions| Ok(Arc::new(FsEngine::open(opts)?) as Arc<dyn Engine>)),
        );
        registry.factories.insert(
            "memory".into(),
            Arc::new(|opts: &EngineOptions| {
                Ok(Arc::new(MemoryEngine::with_clock(opts.clock.clone())) as Arc<dyn Engine>)
            }),
        );
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: EngineFactory) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidConfig("engine name cannot be empty".into()));
        }
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidConfig(format!(
                "engine {} is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Open the named backend
    pub fn open(&self, name: &str, options: &EngineOptions) -> Result<Arc<dyn Engine>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownEngine(name.to_string()))?;
        let engine = factory(options)?;
        tracing::info!(engine = name, path = %options.path.display(), "storage engine opened");
        Ok(engine)
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WriteInput;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let registry = EngineRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["filesystem", "memory", "sled", "sqlite"]);
        assert!(registry.contains("sled"));
        assert!(!registry.contains("bolt"));
    }

    #[test]
    fn test_open_unknown() {
        let registry = EngineRegistry::with_defaults();
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            registry.open("bolt", &EngineOptions::new(dir.path())),
            Err(Error::UnknownEngine(_))
        ));
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = EngineRegistry::new();
        let factory: EngineFactory =
            Arc::new(|_: &EngineOptions| Ok(Arc::new(MemoryEngine::new()) as Arc<dyn Engine>));
        registry.register("custom", factory.clone()).unwrap();
        assert!(registry.register("custom", factory.clone()).is_err());
        assert!(registry.register(" ", factory).is_err());

        let dir = TempDir::new().unwrap();
        let engine = registry
            .open("custom", &EngineOptions::new(dir.path()))
            .unwrap();
        engine.write(&WriteInput::set("k", "v")).unwrap();
        assert!(engine.read(b"k").unwrap().exists);
    }

    #[test]
    fn test_open_each_default() {
        let registry = EngineRegistry::with_defaults();
        for name in registry.names() {
            let dir = TempDir::new().unwrap();
            let engine = registry
                .open(&name, &EngineOptions::new(dir.path().join(&name)))
                .unwrap();
            assert_eq!(engine.name(), name);
            engine.close().unwrap();
        }
    }
}

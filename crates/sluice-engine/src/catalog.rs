//! Registry of the collections a plan may scan.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use sluice_adapters::source::SourceSpec;
use sluice_common::utils::error::{Error, Result};
use sluice_core::execution::source::{RecordSource, SourceCatalog};

/// Thread-safe map from collection name to source, in registration order.
#[derive(Default)]
pub struct Catalog {
    sources: RwLock<IndexMap<String, Arc<dyn RecordSource>>>,
}

impl Catalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog from source specifications.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be built or a name repeats.
    pub fn from_specs(specs: &[SourceSpec]) -> Result<Self> {
        let catalog = Self::new();
        for spec in specs {
            catalog.register(spec.build()?)?;
        }
        Ok(catalog)
    }

    /// Registers a source under its own name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is already taken.
    pub fn register(&self, source: Arc<dyn RecordSource>) -> Result<()> {
        let mut sources = self.sources.write();
        let name = source.name().to_string();
        if sources.contains_key(&name) {
            return Err(Error::Source(format!("collection {name} is already registered")));
        }
        sources.insert(name, source);
        Ok(())
    }

    /// Removes a source. Returns true if it was registered.
    pub fn deregister(&self, name: &str) -> bool {
        self.sources.write().shift_remove(name).is_some()
    }

    /// Registered collection names, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }
}

impl SourceCatalog for Catalog {
    fn resolve(&self, name: &str) -> Option<Arc<dyn RecordSource>> {
        self.sources.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_adapters::source::RangeSource;

    #[test]
    fn test_register_and_resolve() {
        let catalog = Catalog::new();
        catalog
            .register(Arc::new(RangeSource::new("numbers", 0, 10).unwrap()))
            .unwrap();
        assert!(catalog.resolve("numbers").is_some());
        assert!(catalog.resolve("missing").is_none());
        assert!(
            catalog
                .register(Arc::new(RangeSource::new("numbers", 0, 1).unwrap()))
                .is_err()
        );
        assert_eq!(catalog.names(), vec!["numbers".to_string()]);
        assert!(catalog.deregister("numbers"));
    }
}

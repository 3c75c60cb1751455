//! Database catalog abstraction.

use std::sync::Arc;

/// Set of reference databases a search may run against.
///
/// Implementations must be cheap to query; request construction asks the
/// catalog once per submission.
pub trait DatabaseCatalog: Send + Sync {
    /// All known database ids, in display order.
    fn ids(&self) -> Vec<String>;

    /// Whether `id` names a known database.
    fn contains(&self, id: &str) -> bool {
        self.ids().iter().any(|known| known == id)
    }

    /// Databases used when an MSA request names none.
    fn defaults(&self) -> Vec<String>;
}

impl<C> DatabaseCatalog for Arc<C>
where
    C: DatabaseCatalog + ?Sized,
{
    fn ids(&self) -> Vec<String> {
        (**self).ids()
    }

    fn contains(&self, id: &str) -> bool {
        (**self).contains(id)
    }

    fn defaults(&self) -> Vec<String> {
        (**self).defaults()
    }
}

/// In-memory catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticCatalog {
    ids: Vec<String>,
    defaults: Vec<String>,
}

impl StaticCatalog {
    /// Catalog with no default databases.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            defaults: Vec::new(),
        }
    }

    /// Mark `defaults` as the databases used when none are requested.
    ///
    /// Entries not present in the catalog are ignored.
    pub fn with_defaults<I, S>(mut self, defaults: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.defaults = defaults
            .into_iter()
            .map(Into::into)
            .filter(|d| self.ids.contains(d))
            .collect();
        self
    }
}

impl DatabaseCatalog for StaticCatalog {
    fn ids(&self) -> Vec<String> {
        self.ids.clone()
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|known| known == id)
    }

    fn defaults(&self) -> Vec<String> {
        self.defaults.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_must_be_known() {
        let catalog = StaticCatalog::new(["uniref", "bfd"]).with_defaults(["uniref", "nope"]);
        assert_eq!(catalog.defaults(), vec!["uniref".to_string()]);
        assert!(catalog.contains("bfd"));
        assert!(!catalog.contains("nope"));
    }

    #[test]
    fn arc_delegates() {
        let catalog: Arc<dyn DatabaseCatalog> = Arc::new(StaticCatalog::new(["uniref"]));
        assert!(catalog.contains("uniref"));
        assert_eq!(catalog.ids(), vec!["uniref".to_string()]);
    }
}

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::{Catalog, CatalogError};
use crate::config::PlatformSpec;

/// Process-wide catalog registry: each platform loads on first use and stays immutable
/// until an explicit [`CatalogCache::reload`].
#[derive(Debug)]
pub struct CatalogCache {
    specs: Vec<PlatformSpec>,
    loaded: RwLock<HashMap<String, Arc<Catalog>>>,
}

impl CatalogCache {
    #[must_use]
    pub fn new(specs: Vec<PlatformSpec>) -> Self {
        Self {
            specs,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn platforms(&self) -> &[PlatformSpec] {
        &self.specs
    }

    #[must_use]
    pub fn spec(&self, platform: &str) -> Option<&PlatformSpec> {
        self.specs.iter().find(|spec| spec.id == platform)
    }

    #[must_use]
    pub fn is_known(&self, platform: &str) -> bool {
        self.spec(platform).is_some()
    }

    pub fn get(&self, platform: &str) -> Result<Arc<Catalog>, CatalogError> {
        if let Some(catalog) = self
            .loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(platform)
        {
            return Ok(Arc::clone(catalog));
        }

        let spec = self.require_spec(platform)?;
        let mut loaded = self.loaded.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have finished loading while we waited for the write lock.
        if let Some(catalog) = loaded.get(platform) {
            return Ok(Arc::clone(catalog));
        }
        let catalog = Arc::new(Catalog::load(spec)?);
        loaded.insert(platform.to_string(), Arc::clone(&catalog));
        Ok(catalog)
    }

    /// Rebuilds one platform's catalog. Holders of the previous `Arc` keep their snapshot.
    pub fn reload(&self, platform: &str) -> Result<Arc<Catalog>, CatalogError> {
        let spec = self.require_spec(platform)?;
        let catalog = Arc::new(Catalog::load(spec)?);
        self.loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(platform.to_string(), Arc::clone(&catalog));
        tracing::info!(platform, "catalog_reloaded");
        Ok(catalog)
    }

    /// Installs an already-built catalog, replacing any loaded one.
    pub fn insert(&self, catalog: Catalog) -> Result<Arc<Catalog>, CatalogError> {
        self.require_spec(catalog.platform())?;
        let catalog = Arc::new(catalog);
        self.loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(catalog.platform().to_string(), Arc::clone(&catalog));
        Ok(catalog)
    }

    fn require_spec(&self, platform: &str) -> Result<&PlatformSpec, CatalogError> {
        self.spec(platform)
            .ok_or_else(|| CatalogError::UnknownPlatform {
                platform: platform.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::CatalogCache;
    use crate::catalog::CatalogError;
    use crate::config::PlatformSpec;

    fn scratch_spec(tag: &str, ddl: &str) -> PlatformSpec {
        let dir = std::env::temp_dir().join(format!(
            "tabletalk-cache-{tag}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("scratch dir should be created");
        let ddl_path = dir.join("demo.sql");
        std::fs::write(&ddl_path, ddl).expect("ddl should be written");
        PlatformSpec {
            id: "demo".to_string(),
            display_name: "Demo".to_string(),
            ddl_path,
            store_path: dir.join("demo.db"),
        }
    }

    #[test]
    fn unknown_platform_is_reported() {
        let cache = CatalogCache::new(Vec::new());
        assert_eq!(
            cache.get("nope").expect_err("unknown platform must fail"),
            CatalogError::UnknownPlatform {
                platform: "nope".to_string()
            }
        );
    }

    #[test]
    fn loads_once_and_shares_until_reload() {
        let spec = scratch_spec("reload", "CREATE TABLE A (ID INTEGER PRIMARY KEY);");
        let cache = CatalogCache::new(vec![spec.clone()]);

        let first = cache.get("demo").expect("catalog should load");
        let second = cache.get("demo").expect("catalog should be cached");
        assert!(Arc::ptr_eq(&first, &second));

        std::fs::write(
            &spec.ddl_path,
            "CREATE TABLE A (ID INTEGER PRIMARY KEY); CREATE TABLE B (ID INTEGER PRIMARY KEY);",
        )
        .expect("ddl should be rewritten");
        assert_eq!(cache.get("demo").expect("cached").tables().len(), 1);

        let reloaded = cache.reload("demo").expect("reload should succeed");
        assert_eq!(reloaded.tables().len(), 2);
        assert_eq!(first.tables().len(), 1);
    }

    #[test]
    fn broken_ddl_surfaces_schema_load_error() {
        let spec = scratch_spec("broken", "CREATE TABLE (");
        let cache = CatalogCache::new(vec![spec]);
        assert!(matches!(
            cache.get("demo"),
            Err(CatalogError::SchemaLoad { .. })
        ));
    }
}

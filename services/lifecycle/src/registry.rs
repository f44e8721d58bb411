use crate::error::RegistryError;
use crate::provider::{DataTier, StorageProvider, TechnologyClass};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// A registered provider together with its tags
pub struct RegisteredProvider {
    pub name: String,
    pub technology: TechnologyClass,
    pub tiers: Vec<DataTier>,
    pub provider: Arc<dyn StorageProvider>,
}

impl RegisteredProvider {
    pub fn serves(&self, tier: DataTier) -> bool {
        self.tiers.contains(&tier)
    }
}

impl fmt::Debug for RegisteredProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("name", &self.name)
            .field("technology", &self.technology)
            .field("tiers", &self.tiers)
            .finish()
    }
}

pub type ProviderHandle = Arc<RegisteredProvider>;

/// Lookup tables from tier, technology class and logical table to providers.
///
/// Registration order is preserved, so "first provider of a tier" is
/// deterministic for the lifetime of the registry. Tables resolve through an
/// explicit routing map with an optional default provider.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: Vec<ProviderHandle>,
    by_technology: HashMap<TechnologyClass, Vec<ProviderHandle>>,
    routing: RwLock<HashMap<String, String>>,
    default_provider: Option<String>,
    archive_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    /// Providers serving a tier, in registration order
    pub fn providers_for_tier(&self, tier: DataTier) -> Vec<ProviderHandle> {
        self.providers
            .iter()
            .filter(|p| p.serves(tier))
            .cloned()
            .collect()
    }

    /// Providers of a technology class, in registration order
    pub fn providers_for_technology(&self, technology: TechnologyClass) -> Vec<ProviderHandle> {
        self.by_technology
            .get(&technology)
            .cloned()
            .unwrap_or_default()
    }

    pub fn provider(&self, name: &str) -> Result<ProviderHandle, RegistryError> {
        self.providers
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownProvider(name.to_string()))
    }

    /// The provider currently owning a table
    pub fn provider_for_table(&self, table: &str) -> Result<ProviderHandle, RegistryError> {
        let routed = self.routing.read().get(table).cloned();
        match routed.or_else(|| self.default_provider.clone()) {
            Some(name) => self.provider(&name),
            None => Err(RegistryError::NoProviderForTable(table.to_string())),
        }
    }

    /// Provider receiving archived records: the configured one, else the first cold provider
    pub fn archive_provider(&self) -> Result<ProviderHandle, RegistryError> {
        match &self.archive_provider {
            Some(name) => self.provider(name),
            None => self
                .providers_for_tier(DataTier::Cold)
                .into_iter()
                .next()
                .ok_or(RegistryError::NoArchiveProvider),
        }
    }

    /// Route a table to another provider
    pub fn rebind(&self, table: &str, provider: &str) -> Result<(), RegistryError> {
        self.provider(provider)?;
        let previous = self
            .routing
            .write()
            .insert(table.to_string(), provider.to_string());
        info!(
            table = %table,
            provider = %provider,
            previous = ?previous,
            "Table routed to new provider"
        );
        Ok(())
    }

    pub fn all(&self) -> &[ProviderHandle] {
        &self.providers
    }
}

/// Builder for [`ProviderRegistry`]
#[derive(Default)]
pub struct ProviderRegistryBuilder {
    providers: Vec<RegisteredProvider>,
    routing: HashMap<String, String>,
    default_provider: Option<String>,
    archive_provider: Option<String>,
}

impl ProviderRegistryBuilder {
    pub fn register(
        mut self,
        name: impl Into<String>,
        technology: TechnologyClass,
        tiers: impl IntoIterator<Item = DataTier>,
        provider: Arc<dyn StorageProvider>,
    ) -> Self {
        self.providers.push(RegisteredProvider {
            name: name.into(),
            technology,
            tiers: tiers.into_iter().collect(),
            provider,
        });
        self
    }

    pub fn route(mut self, table: impl Into<String>, provider: impl Into<String>) -> Self {
        self.routing.insert(table.into(), provider.into());
        self
    }

    pub fn routes(mut self, routes: impl IntoIterator<Item = (String, String)>) -> Self {
        self.routing.extend(routes);
        self
    }

    pub fn default_provider(mut self, provider: impl Into<String>) -> Self {
        self.default_provider = Some(provider.into());
        self
    }

    pub fn archive_provider(mut self, provider: impl Into<String>) -> Self {
        self.archive_provider = Some(provider.into());
        self
    }

    /// Build the registry, checking that every referenced provider exists
    pub fn build(self) -> Result<ProviderRegistry, RegistryError> {
        let mut providers: Vec<ProviderHandle> = Vec::with_capacity(self.providers.len());
        let mut by_technology: HashMap<TechnologyClass, Vec<ProviderHandle>> = HashMap::new();

        for registered in self.providers {
            if providers.iter().any(|p| p.name == registered.name) {
                return Err(RegistryError::DuplicateProvider(registered.name));
            }
            let handle = Arc::new(registered);
            by_technology
                .entry(handle.technology)
                .or_default()
                .push(handle.clone());
            providers.push(handle);
        }

        let known = |name: &str| providers.iter().any(|p| p.name == name);
        let referenced = self
            .routing
            .values()
            .chain(self.default_provider.iter())
            .chain(self.archive_provider.iter());
        for name in referenced {
            if !known(name) {
                return Err(RegistryError::UnknownProvider(name.clone()));
            }
        }

        Ok(ProviderRegistry {
            providers,
            by_technology,
            routing: RwLock::new(self.routing),
            default_provider: self.default_provider,
            archive_provider: self.archive_provider,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::builder()
            .register(
                "cache",
                TechnologyClass::KeyValueCache,
                [DataTier::Hot],
                Arc::new(MemoryProvider::new("cache")),
            )
            .register(
                "docs",
                TechnologyClass::Document,
                [DataTier::Warm],
                Arc::new(MemoryProvider::new("docs")),
            )
            .register(
                "pg",
                TechnologyClass::Relational,
                [DataTier::Warm],
                Arc::new(MemoryProvider::new("pg")),
            )
            .register(
                "s3",
                TechnologyClass::ObjectStore,
                [DataTier::Cold],
                Arc::new(MemoryProvider::new("s3")),
            )
            .route("sessions", "pg")
            .default_provider("docs")
            .build()
            .unwrap()
    }

    #[test]
    fn test_providers_for_tier_preserve_order() {
        let registry = registry();
        let warm: Vec<String> = registry
            .providers_for_tier(DataTier::Warm)
            .iter()
            .map(|p| p.name.clone())
            .collect();

        assert_eq!(warm, vec!["docs", "pg"]);
        assert_eq!(registry.providers_for_technology(TechnologyClass::Relational).len(), 1);
        assert!(registry.providers_for_technology(TechnologyClass::Warehouse).is_empty());
    }

    #[test]
    fn test_table_resolution_uses_routing_then_default() {
        let registry = registry();

        assert_eq!(registry.provider_for_table("sessions").unwrap().name, "pg");
        assert_eq!(registry.provider_for_table("orders").unwrap().name, "docs");
        // Stable across calls
        assert_eq!(registry.provider_for_table("sessions").unwrap().name, "pg");
    }

    #[test]
    fn test_table_resolution_fails_without_route() {
        let registry = ProviderRegistry::builder()
            .register(
                "cache",
                TechnologyClass::KeyValueCache,
                [DataTier::Hot],
                Arc::new(MemoryProvider::new("cache")),
            )
            .build()
            .unwrap();

        assert_eq!(
            registry.provider_for_table("sessions").unwrap_err(),
            RegistryError::NoProviderForTable("sessions".to_string())
        );
    }

    #[test]
    fn test_archive_provider_defaults_to_first_cold() {
        assert_eq!(registry().archive_provider().unwrap().name, "s3");

        let no_cold = ProviderRegistry::builder()
            .register(
                "cache",
                TechnologyClass::KeyValueCache,
                [DataTier::Hot],
                Arc::new(MemoryProvider::new("cache")),
            )
            .build()
            .unwrap();
        assert_eq!(no_cold.archive_provider().unwrap_err(), RegistryError::NoArchiveProvider);
    }

    #[test]
    fn test_rebind() {
        let registry = registry();
        registry.rebind("sessions", "s3").unwrap();
        assert_eq!(registry.provider_for_table("sessions").unwrap().name, "s3");
        assert!(registry.rebind("sessions", "nowhere").is_err());
    }

    #[test]
    fn test_build_rejects_unknown_and_duplicate_names() {
        let unknown = ProviderRegistry::builder()
            .register(
                "cache",
                TechnologyClass::KeyValueCache,
                [DataTier::Hot],
                Arc::new(MemoryProvider::new("cache")),
            )
            .route("sessions", "pg")
            .build();
        assert_eq!(unknown.unwrap_err(), RegistryError::UnknownProvider("pg".to_string()));

        let duplicate = ProviderRegistry::builder()
            .register(
                "cache",
                TechnologyClass::KeyValueCache,
                [DataTier::Hot],
                Arc::new(MemoryProvider::new("cache")),
            )
            .register(
                "cache",
                TechnologyClass::KeyValueCache,
                [DataTier::Hot],
                Arc::new(MemoryProvider::new("cache")),
            )
            .build();
        assert_eq!(duplicate.unwrap_err(), RegistryError::DuplicateProvider("cache".to_string()));
    }
}

use crate::connection::config::SCHEME;
use crate::core::{MigrateError, Result};
use crate::driver::{Driver, QldbDriver};
use crate::ledger::LedgerConnector;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// Opens a driver from a full connection string
pub type DriverFactory = Arc<dyn Fn(String) -> BoxFuture<'static, Result<Box<dyn Driver>>> + Send + Sync>;

/// Factory for `qldb://` URLs connecting through `connector`
pub fn qldb_factory(connector: Arc<dyn LedgerConnector>) -> DriverFactory {
    Arc::new(move |url: String| {
        let connector = Arc::clone(&connector);
        Box::pin(async move {
            let driver = QldbDriver::open(&url, connector.as_ref()).await?;
            Ok(Box::new(driver) as Box<dyn Driver>)
        })
    })
}

/// Maps URL schemes to driver factories
///
/// Built explicitly at start-up; nothing registers itself.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `qldb` driver bound to `connector`
    pub fn with_defaults(connector: Arc<dyn LedgerConnector>) -> Self {
        let mut registry = Self::new();
        registry.register(SCHEME, qldb_factory(connector));
        registry
    }

    /// Register a factory, returning the one it replaces
    pub fn register(&mut self, scheme: &str, factory: DriverFactory) -> Option<DriverFactory> {
        log::debug!("Registered migration driver for scheme '{}'", scheme);
        self.factories.insert(scheme.to_ascii_lowercase(), factory)
    }

    pub fn get(&self, scheme: &str) -> Option<DriverFactory> {
        self.factories.get(&scheme.to_ascii_lowercase()).cloned()
    }

    /// Registered schemes, sorted
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Open a driver for `url` using the factory registered for its scheme
    pub async fn open(&self, url: &str) -> Result<Box<dyn Driver>> {
        let parsed = Url::parse(url).map_err(|e| MigrateError::Config(e.to_string()))?;
        let factory = self
            .get(parsed.scheme())
            .ok_or_else(|| MigrateError::UnknownScheme(parsed.scheme().to_string()))?;
        factory(url.to_string()).await
    }
}

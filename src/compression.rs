//! Lazily-populated cache of [`CompressionProvider`] instances, owned exclusively by the
//! receive pipeline (`spec.md` §9, "Compression provider cache").
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::collaborators::CompressionProvider;
use crate::collaborators::CompressionProviderFactory;
use crate::wire::CompressionType;

/// Caches one [`CompressionProvider`] per [`CompressionType`], created on first use.
///
/// There is no eviction: the key space is the four-member compression enum, so the cache
/// never grows beyond four entries.
pub struct CompressionProviders {
    factory: Arc<dyn CompressionProviderFactory>,
    providers: Mutex<HashMap<CompressionType, Arc<dyn CompressionProvider>>>,
}

impl CompressionProviders {
    pub fn new(factory: Arc<dyn CompressionProviderFactory>) -> CompressionProviders {
        CompressionProviders {
            factory,
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// Return the provider for `compression`, creating and caching it if this is the
    /// first request for that type.
    pub async fn get(&self, compression: CompressionType) -> Arc<dyn CompressionProvider> {
        let mut providers = self.providers.lock().await;
        if let Some(provider) = providers.get(&compression) {
            return provider.clone();
        }
        let provider: Arc<dyn CompressionProvider> = self.factory.provider_for(compression).into();
        providers.insert(compression, provider.clone());
        provider
    }

    /// Close every cached provider. Called once, as part of consumer shutdown.
    pub async fn close_all(&self) {
        let providers = self.providers.lock().await;
        for provider in providers.values() {
            provider.close().await;
        }
    }
}

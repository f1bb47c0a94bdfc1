//! Registry of every proxy in the process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{LimitsConfig, ProxyConfig};
use crate::error::{Error, Result};
use crate::proxy::Proxy;

/// Proxies keyed by name. Cloning shares the same registry.
#[derive(Clone, Default)]
pub struct ProxyCollection {
    proxies: Arc<RwLock<HashMap<String, Arc<Proxy>>>>,
    limits: LimitsConfig,
}

impl ProxyCollection {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            proxies: Arc::new(RwLock::new(HashMap::new())),
            limits,
        }
    }

    /// Create a proxy and start it if enabled.
    pub async fn add(&self, config: ProxyConfig) -> Result<Arc<Proxy>> {
        config.validate()?;
        let mut proxies = self.proxies.write().await;
        if proxies.contains_key(&config.name) {
            return Err(Error::ProxyExists(config.name));
        }

        let name = config.name.clone();
        let proxy = Arc::new(Proxy::new(config, self.limits)?);
        proxy.start().await?;
        proxies.insert(name, Arc::clone(&proxy));
        Ok(proxy)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<Proxy>> {
        self.proxies
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ProxyNotFound(name.to_string()))
    }

    /// Every proxy, sorted by name.
    pub async fn list(&self) -> Vec<Arc<Proxy>> {
        let proxies = self.proxies.read().await;
        let mut names: Vec<&String> = proxies.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| proxies.get(name).cloned())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.proxies.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove a proxy, closing its listener and links.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let proxy = self
            .proxies
            .write()
            .await
            .remove(name)
            .ok_or_else(|| Error::ProxyNotFound(name.to_string()))?;
        proxy.stop().await;
        info!("Proxy {} deleted", name);
        Ok(())
    }

    /// Create every proxy in `configs` that does not exist yet.
    ///
    /// Existing proxies whose declared config matches are left running. A
    /// differing config for an existing name, a duplicate name or an invalid
    /// definition rejects the whole batch. If a new proxy fails to start,
    /// the proxies created by this call are removed again.
    pub async fn populate(&self, configs: Vec<ProxyConfig>) -> Result<Vec<Arc<Proxy>>> {
        let mut names = HashSet::new();
        for config in &configs {
            config.validate()?;
            if !names.insert(config.name.as_str()) {
                return Err(Error::InvalidProxy(format!(
                    "duplicate proxy name in batch: {}",
                    config.name
                )));
            }
        }

        let mut proxies = self.proxies.write().await;
        for config in &configs {
            if let Some(existing) = proxies.get(&config.name) {
                if existing.config().await != *config {
                    return Err(Error::ProxyExists(config.name.clone()));
                }
            }
        }

        let mut result = Vec::with_capacity(configs.len());
        let mut created: Vec<Arc<Proxy>> = Vec::new();
        for config in configs {
            if let Some(existing) = proxies.get(&config.name) {
                result.push(Arc::clone(existing));
                continue;
            }

            let proxy = Arc::new(Proxy::new(config, self.limits)?);
            if let Err(e) = proxy.start().await {
                warn!(
                    "populate failed starting {}: {}; rolling back {} proxies",
                    proxy.name().await,
                    e,
                    created.len()
                );
                for proxy in &created {
                    proxies.remove(&proxy.name().await);
                    proxy.stop().await;
                }
                return Err(e);
            }
            proxies.insert(proxy.name().await, Arc::clone(&proxy));
            created.push(Arc::clone(&proxy));
            result.push(proxy);
        }

        info!(
            "Populated {} proxies ({} new)",
            result.len(),
            created.len()
        );
        Ok(result)
    }

    /// Remove every proxy. Returns once all listeners and links are closed.
    pub async fn destroy_all(&self) {
        let drained: Vec<Arc<Proxy>> = {
            let mut proxies = self.proxies.write().await;
            proxies.drain().map(|(_, proxy)| proxy).collect()
        };
        if drained.is_empty() {
            return;
        }

        let count = drained.len();
        join_all(drained.iter().map(|proxy| proxy.stop())).await;
        info!("Destroyed {} proxies", count);
    }

    /// Enable every proxy and remove all toxics.
    pub async fn reset(&self) -> Result<()> {
        for proxy in self.list().await {
            proxy.clear_toxics().await;
            proxy.enable().await?;
        }
        Ok(())
    }
}

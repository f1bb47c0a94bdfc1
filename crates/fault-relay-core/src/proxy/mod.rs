//! Named fault-injection points.

pub mod listener;

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::ProxyToxics;
use crate::config::{LimitsConfig, ProxyConfig};
use crate::connection::ConnectionInfo;
use crate::error::Result;
use crate::link::LinkRegistry;
use crate::toxic::{Toxic, ToxicUpdate};

use listener::{accept_loop, ListenerContext};

/// Public view of a proxy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyInfo {
    pub name: String,

    /// Bound address while enabled, declared address otherwise.
    pub listen: String,

    pub upstream: String,

    pub enabled: bool,

    pub toxics: Vec<Toxic>,
}

/// Partial update of a proxy. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyUpdate {
    #[serde(default)]
    pub listen: Option<String>,

    #[serde(default)]
    pub upstream: Option<String>,

    #[serde(default)]
    pub enabled: Option<bool>,
}

struct Running {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A listener forwarding every accepted client to one upstream.
///
/// Disabling force-closes every link: the accept loop is stopped first so no
/// new link can appear, then all links are cancelled and awaited.
pub struct Proxy {
    config: RwLock<ProxyConfig>,
    limits: LimitsConfig,
    toxics: Arc<ProxyToxics>,
    links: Arc<LinkRegistry>,
    running: Mutex<Option<Running>>,
}

impl Proxy {
    /// Create a stopped proxy. Call [`Proxy::start`] to honour `enabled`.
    pub fn new(config: ProxyConfig, limits: LimitsConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: RwLock::new(config),
            limits,
            toxics: Arc::new(ProxyToxics::default()),
            links: Arc::new(LinkRegistry::default()),
            running: Mutex::new(None),
        })
    }

    /// Declared configuration.
    pub async fn config(&self) -> ProxyConfig {
        self.config.read().await.clone()
    }

    pub async fn name(&self) -> String {
        self.config.read().await.name.clone()
    }

    /// Address the listener is bound to, if enabled.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Bind the listener if the declared config is enabled.
    pub async fn start(&self) -> Result<()> {
        if self.config.read().await.enabled {
            self.listen().await?;
        }
        Ok(())
    }

    /// Start accepting connections.
    pub async fn enable(&self) -> Result<()> {
        self.listen().await?;
        self.config.write().await.enabled = true;
        Ok(())
    }

    /// Stop accepting connections and close every link.
    pub async fn disable(&self) {
        self.stop().await;
        self.config.write().await.enabled = false;
    }

    /// Stop listening and close every link, keeping the declared config.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.task.await {
                debug!("accept loop ended abnormally: {}", e);
            }
            info!(
                "Proxy {} stopped listening on {}",
                self.name().await,
                running.addr
            );
        }
        self.links.close_all().await;
    }

    async fn listen(&self) -> Result<()> {
        if self.running.lock().await.is_some() {
            return Ok(());
        }
        let address = self.config.read().await.listen.clone();
        let listener = TcpListener::bind(&address).await?;
        self.serve(listener).await
    }

    /// Run the accept loop on an already bound listener.
    async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let config = self.config.read().await.clone();
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let context = ListenerContext {
            proxy: config.name.clone(),
            upstream: config.upstream.clone(),
            limits: self.limits,
            toxics: Arc::clone(&self.toxics),
            links: Arc::clone(&self.links),
        };
        let task = tokio::spawn(accept_loop(listener, context, cancel.clone()));

        info!(
            "Proxy {} listening on {}, forwarding to {}",
            config.name, addr, config.upstream
        );
        *running = Some(Running { addr, cancel, task });
        Ok(())
    }

    /// Apply a partial update. A changed address restarts the listener.
    pub async fn update(&self, update: ProxyUpdate) -> Result<ProxyInfo> {
        let current = self.config().await;
        let mut next = current.clone();
        if let Some(listen) = update.listen {
            next.listen = listen;
        }
        if let Some(upstream) = update.upstream {
            next.upstream = upstream;
        }
        if let Some(enabled) = update.enabled {
            next.enabled = enabled;
        }
        next.validate()?;

        // A new address is bound before the old listener goes away, so a
        // failed bind leaves the proxy untouched.
        let bound = self.local_addr().await.map(|addr| addr.to_string());
        let relisten = next.listen != current.listen && bound.as_ref() != Some(&next.listen);
        let listener = if next.enabled && relisten {
            Some(TcpListener::bind(&next.listen).await?)
        } else {
            None
        };

        let moved = relisten || next.upstream != current.upstream;
        if moved || !next.enabled {
            self.stop().await;
        }
        *self.config.write().await = next;

        let started = match listener {
            Some(listener) => self.serve(listener).await,
            None => self.start().await,
        };
        if let Err(e) = started {
            warn!(
                "Proxy {}: update failed, restoring previous config: {}",
                current.name, e
            );
            *self.config.write().await = current;
            if let Err(restore) = self.start().await {
                warn!("Proxy {}: restart after failed update: {}", self.name().await, restore);
            }
            return Err(e);
        }

        Ok(self.info().await)
    }

    pub async fn info(&self) -> ProxyInfo {
        let config = self.config().await;
        let listen = match self.local_addr().await {
            Some(addr) => addr.to_string(),
            None => config.listen,
        };
        ProxyInfo {
            name: config.name,
            listen,
            upstream: config.upstream,
            enabled: config.enabled,
            toxics: self.toxics(),
        }
    }

    pub fn toxics(&self) -> Vec<Toxic> {
        self.toxics.list()
    }

    pub fn toxic(&self, name: &str) -> Result<Toxic> {
        self.toxics.get(name)
    }

    pub async fn add_toxic(&self, toxic: Toxic) -> Result<Toxic> {
        let toxic = self.toxics.add(toxic).await?;
        info!(
            "Proxy {}: added {} toxic {} on {}",
            self.name().await,
            toxic.kind.type_name(),
            toxic.name,
            toxic.stream
        );
        Ok(toxic)
    }

    pub async fn update_toxic(&self, name: &str, update: &ToxicUpdate) -> Result<Toxic> {
        self.toxics.update(name, update).await
    }

    pub async fn remove_toxic(&self, name: &str) -> Result<Toxic> {
        let toxic = self.toxics.remove(name).await?;
        info!("Proxy {}: removed toxic {}", self.name().await, name);
        Ok(toxic)
    }

    pub async fn clear_toxics(&self) {
        self.toxics.clear().await;
    }

    /// Live links.
    pub async fn links(&self) -> Vec<ConnectionInfo> {
        self.links.list().await
    }

    pub async fn link_count(&self) -> usize {
        self.links.len().await
    }
}

//! Accept loop and per-client link setup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chain::ProxyToxics;
use crate::config::LimitsConfig;
use crate::connection::{ByteCounters, ConnectionInfo};
use crate::error::{Error, Result};
use crate::link::{Link, LinkRegistry, PumpEnd};
use crate::toxic::Direction;

/// Everything the accept loop needs from its proxy.
pub(crate) struct ListenerContext {
    pub proxy: String,
    pub upstream: String,
    pub limits: LimitsConfig,
    pub toxics: Arc<ProxyToxics>,
    pub links: Arc<LinkRegistry>,
}

/// Accept clients until cancelled. The listener is dropped on return.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    context: ListenerContext,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, client_addr)) => {
                let info = ConnectionInfo::new(
                    context.proxy.clone(),
                    client_addr.to_string(),
                    context.upstream.clone(),
                );
                let id = info.id;
                let counters = Arc::new(ByteCounters::default());
                let link_cancel = cancel.child_token();

                let task = serve_client(
                    stream,
                    client_addr,
                    ClientContext {
                        id,
                        proxy: context.proxy.clone(),
                        upstream: context.upstream.clone(),
                        limits: context.limits,
                        toxics: Arc::clone(&context.toxics),
                        links: Arc::clone(&context.links),
                        counters: Arc::clone(&counters),
                        cancel: link_cancel.clone(),
                    },
                );
                context
                    .links
                    .spawn(info, counters, link_cancel, task)
                    .await;
            }
            Err(e) => {
                error!("Proxy {}: failed to accept connection: {}", context.proxy, e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

struct ClientContext {
    id: Uuid,
    proxy: String,
    upstream: String,
    limits: LimitsConfig,
    toxics: Arc<ProxyToxics>,
    links: Arc<LinkRegistry>,
    counters: Arc<ByteCounters>,
    cancel: CancellationToken,
}

/// Dial upstream and run the link. A failed dial drops the client.
async fn serve_client(client: TcpStream, client_addr: SocketAddr, ctx: ClientContext) {
    debug!("Proxy {}: accepted {}", ctx.proxy, client_addr);

    let upstream = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        dialed = dial(&ctx.upstream, ctx.limits.dial_timeout()) => dialed,
    };
    let upstream = match upstream {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                "Proxy {}: unable to dial upstream {} for {}: {}",
                ctx.proxy, ctx.upstream, client_addr, e
            );
            return;
        }
    };

    for (side, stream) in [("client", &client), ("upstream", &upstream)] {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Proxy {}: {} set_nodelay failed: {}", ctx.proxy, side, e);
        }
    }
    ctx.links.mark_active(ctx.id).await;

    let link = Link::new(
        ctx.id,
        client,
        upstream,
        ctx.toxics,
        Arc::clone(&ctx.counters),
        ctx.cancel,
        ctx.limits.buffer_size,
    );
    let (up, down) = link.run().await;

    for end in [&up, &down] {
        if let PumpEnd::Failed(e) = end {
            error!("Proxy {}: link {} I/O error: {}", ctx.proxy, client_addr, e);
        }
    }
    info!(
        "Proxy {}: link {} closed (upstream: {}, downstream: {}, sent: {}, recv: {})",
        ctx.proxy,
        client_addr,
        end_label(&up),
        end_label(&down),
        ctx.counters.get(Direction::Upstream),
        ctx.counters.get(Direction::Downstream),
    );
}

fn end_label(end: &PumpEnd) -> &'static str {
    match end {
        PumpEnd::Eof => "eof",
        PumpEnd::Cancelled => "cancelled",
        PumpEnd::Closed => "closed",
        PumpEnd::Reset => "reset",
        PumpEnd::Failed(_) => "failed",
    }
}

/// Connect to `upstream` within `limit`.
pub async fn dial(upstream: &str, limit: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(limit, TcpStream::connect(upstream)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(Error::Timeout),
    }
}

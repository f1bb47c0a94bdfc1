//! Proxied connections.
//!
//! A [`Link`] pairs an accepted client socket with its upstream socket and
//! runs one [`Pump`] per direction. Each pump reads a chunk, runs it through
//! the direction's toxic chain and writes the resulting schedule.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::future::join_all;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::chain::{ChainReader, Fate, InFlight, ProxyToxics, Step};
use crate::connection::{ByteCounters, ConnectionInfo, ConnectionState};
use crate::toxic::{Direction, Schedule};

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpEnd {
    /// The source closed and the destination was half-closed.
    Eof,
    /// The link was torn down from outside.
    Cancelled,
    /// A toxic closed the link.
    Closed,
    /// A toxic reset the link.
    Reset,
    /// Read or write failed.
    Failed(io::Error),
}

impl PumpEnd {
    /// Whether the other direction must stop too.
    pub fn ends_link(&self) -> bool {
        !matches!(self, PumpEnd::Eof)
    }
}

impl From<Fate> for PumpEnd {
    fn from(fate: Fate) -> Self {
        match fate {
            Fate::Close => PumpEnd::Closed,
            Fate::Reset => PumpEnd::Reset,
        }
    }
}

async fn expire(deadline: Option<(Instant, Fate)>) -> Fate {
    match deadline {
        Some((at, fate)) => {
            tokio::time::sleep_until(at).await;
            fate
        }
        None => std::future::pending().await,
    }
}

/// Moves bytes in one direction of a link.
#[derive(Debug)]
pub struct Pump {
    direction: Direction,
    chain: ChainReader,
    cancel: CancellationToken,
    counters: Arc<ByteCounters>,
    buffer_size: usize,
}

impl Pump {
    pub fn new(
        direction: Direction,
        chain: ChainReader,
        cancel: CancellationToken,
        counters: Arc<ByteCounters>,
        buffer_size: usize,
    ) -> Self {
        Self {
            direction,
            chain,
            cancel,
            counters,
            buffer_size: buffer_size.max(1),
        }
    }

    /// Pump until the source closes, the link is cancelled, a toxic ends it
    /// or I/O fails.
    pub async fn run<R, W>(mut self, reader: &mut R, writer: &mut W) -> PumpEnd
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(self.buffer_size);
        let mut held: Option<InFlight> = None;

        loop {
            if let Some(chunk) = held.take() {
                match self.chain.process(chunk) {
                    Step::Ready(schedule) => {
                        if let Some(end) = self.write(schedule, writer).await {
                            return end;
                        }
                    }
                    Step::Held(chunk) => {
                        held = Some(chunk);
                        let deadline = self.chain.deadline();
                        tokio::select! {
                            _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                            fate = expire(deadline) => return fate.into(),
                            _ = self.chain.changed() => {}
                        }
                    }
                }
                continue;
            }

            buf.reserve(self.buffer_size);
            let deadline = self.chain.deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                fate = expire(deadline) => return fate.into(),
                _ = self.chain.changed() => {}
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => return self.close(writer).await,
                    Ok(_) => held = Some(InFlight::new(buf.split().freeze())),
                    Err(e) => return PumpEnd::Failed(e),
                },
            }
        }
    }

    async fn write<W>(&mut self, schedule: Schedule, writer: &mut W) -> Option<PumpEnd>
    where
        W: AsyncWrite + Unpin,
    {
        let deadline = self.chain.deadline();
        for segment in schedule.segments {
            if !segment.delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Some(PumpEnd::Cancelled),
                    fate = expire(deadline) => return Some(fate.into()),
                    _ = tokio::time::sleep(segment.delay) => {}
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Some(PumpEnd::Cancelled),
                written = writer.write_all(&segment.data) => {
                    if let Err(e) = written {
                        return Some(PumpEnd::Failed(e));
                    }
                }
            }
            self.counters
                .add(self.direction, segment.data.len() as u64);
        }

        if schedule.close_after {
            return Some(PumpEnd::Closed);
        }
        None
    }

    // The close is held like data while the direction is blocked.
    async fn close<W>(&mut self, writer: &mut W) -> PumpEnd
    where
        W: AsyncWrite + Unpin,
    {
        while self.chain.is_blocked() {
            let deadline = self.chain.deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                fate = expire(deadline) => return fate.into(),
                _ = self.chain.changed() => {}
            }
        }

        let delay = self.chain.close_delay();
        if !delay.is_zero() {
            tokio::select! {
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if let Err(e) = writer.shutdown().await {
            debug!("{} shutdown failed: {}", self.direction, e);
        }
        PumpEnd::Eof
    }
}

/// One proxied TCP connection.
pub struct Link {
    id: Uuid,
    client: TcpStream,
    upstream: TcpStream,
    toxics: Arc<ProxyToxics>,
    counters: Arc<ByteCounters>,
    cancel: CancellationToken,
    buffer_size: usize,
}

impl Link {
    pub fn new(
        id: Uuid,
        client: TcpStream,
        upstream: TcpStream,
        toxics: Arc<ProxyToxics>,
        counters: Arc<ByteCounters>,
        cancel: CancellationToken,
        buffer_size: usize,
    ) -> Self {
        Self {
            id,
            client,
            upstream,
            toxics,
            counters,
            cancel,
            buffer_size,
        }
    }

    /// Run both pumps to completion. Returns how the upstream and
    /// downstream pumps ended.
    pub async fn run(self) -> (PumpEnd, PumpEnd) {
        let (mut client_read, mut client_write) = self.client.into_split();
        let (mut upstream_read, mut upstream_write) = self.upstream.into_split();
        let link_cancel = self.cancel.child_token();

        let to_upstream = Pump::new(
            Direction::Upstream,
            self.toxics.chain(Direction::Upstream).reader(),
            link_cancel.clone(),
            Arc::clone(&self.counters),
            self.buffer_size,
        );
        let to_client = Pump::new(
            Direction::Downstream,
            self.toxics.chain(Direction::Downstream).reader(),
            link_cancel.clone(),
            Arc::clone(&self.counters),
            self.buffer_size,
        );

        let upstream_side = async {
            let end = to_upstream.run(&mut client_read, &mut upstream_write).await;
            if end.ends_link() {
                link_cancel.cancel();
            }
            end
        };
        let downstream_side = async {
            let end = to_client.run(&mut upstream_read, &mut client_write).await;
            if end.ends_link() {
                link_cancel.cancel();
            }
            end
        };
        let (up, down) = tokio::join!(upstream_side, downstream_side);

        let reset = matches!(up, PumpEnd::Reset) || matches!(down, PumpEnd::Reset);
        // Reunite so dropping does not send a FIN ahead of the reset.
        let sockets = [
            client_read.reunite(client_write),
            upstream_read.reunite(upstream_write),
        ];
        if reset {
            for socket in sockets.iter().flatten() {
                // Deprecated because a non-zero linger blocks the dropping
                // thread; a zero linger returns immediately with a reset.
                #[allow(deprecated)]
                let lingered = socket.set_linger(Some(Duration::ZERO));
                if let Err(e) = lingered {
                    debug!("link {} set_linger failed: {}", self.id, e);
                }
            }
        }
        drop(sockets);

        (up, down)
    }
}

#[derive(Debug)]
struct LinkEntry {
    info: ConnectionInfo,
    counters: Arc<ByteCounters>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Links owned by one proxy.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    entries: Mutex<HashMap<Uuid, LinkEntry>>,
}

impl LinkRegistry {
    /// Spawn a link task and track it until it finishes.
    pub async fn spawn<F>(
        self: &Arc<Self>,
        info: ConnectionInfo,
        counters: Arc<ByteCounters>,
        cancel: CancellationToken,
        task: F,
    ) where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = info.id;
        let registry = Arc::clone(self);
        let mut entries = self.entries.lock().await;
        let handle = tokio::spawn(async move {
            if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                error!("link {} task panicked", id);
            }
            registry.entries.lock().await.remove(&id);
        });
        entries.insert(
            id,
            LinkEntry {
                info,
                counters,
                cancel,
                task: Some(handle),
            },
        );
    }

    pub async fn mark_active(&self, id: Uuid) {
        if let Some(entry) = self.entries.lock().await.get_mut(&id) {
            entry.info.set_active();
        }
    }

    /// Snapshot of established links, oldest first. Clients still dialing
    /// upstream are tracked but not listed.
    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let entries = self.entries.lock().await;
        let mut links: Vec<ConnectionInfo> = entries
            .values()
            .filter(|entry| entry.info.state == ConnectionState::Active)
            .map(|entry| {
                let mut info = entry.info.clone();
                info.record(&entry.counters);
                info
            })
            .collect();
        links.sort_by_key(|info| info.connected_at);
        links
    }

    /// Tracked client tasks, including ones still dialing.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cancel every link and wait for all of them to finish.
    pub async fn close_all(&self) {
        let drained: Vec<LinkEntry> = self
            .entries
            .lock()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        if drained.is_empty() {
            return;
        }

        debug!("closing {} links", drained.len());
        for entry in &drained {
            entry.cancel.cancel();
        }
        join_all(drained.into_iter().filter_map(|entry| entry.task)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ToxicChain;
    use crate::toxic::{Toxic, ToxicKind};
    use tokio::io::duplex;
    use tokio::time::timeout;

    fn pump(chain: &ToxicChain, cancel: &CancellationToken) -> (Pump, Arc<ByteCounters>) {
        let counters = Arc::new(ByteCounters::default());
        let pump = Pump::new(
            chain.direction(),
            chain.reader().with_seed(3),
            cancel.clone(),
            Arc::clone(&counters),
            1024,
        );
        (pump, counters)
    }

    #[tokio::test]
    async fn forwards_bytes_and_half_closes() {
        let chain = ToxicChain::new(Direction::Upstream);
        let cancel = CancellationToken::new();
        let (pump, counters) = pump(&chain, &cancel);

        let (mut client, mut source) = duplex(64);
        let (mut sink, mut server) = duplex(64);

        let task = tokio::spawn(async move { pump.run(&mut source, &mut sink).await });

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");

        let end = task.await.unwrap();
        assert!(matches!(end, PumpEnd::Eof));
        assert_eq!(counters.get(Direction::Upstream), 4);
    }

    #[tokio::test]
    async fn timeout_toxic_holds_until_removed() {
        let chain = ToxicChain::new(Direction::Downstream);
        chain
            .add(Toxic::new(
                "hold",
                Direction::Downstream,
                ToxicKind::Timeout { timeout: 0 },
            ))
            .unwrap();
        let cancel = CancellationToken::new();
        let (pump, _) = pump(&chain, &cancel);

        let (mut upstream, mut source) = duplex(64);
        let (mut sink, mut client) = duplex(64);
        let task = tokio::spawn(async move { pump.run(&mut source, &mut sink).await });

        upstream.write_all(b"first").await.unwrap();
        let mut buf = [0u8; 16];
        let blocked = timeout(Duration::from_millis(150), client.read(&mut buf)).await;
        assert!(blocked.is_err(), "no bytes may pass a timeout toxic");

        chain.remove("hold").unwrap();
        upstream.write_all(b"second").await.unwrap();

        let mut received = Vec::new();
        while received.len() < 11 {
            let n = timeout(Duration::from_secs(1), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"firstsecond");

        cancel.cancel();
        assert!(matches!(task.await.unwrap(), PumpEnd::Cancelled));
    }

    #[tokio::test]
    async fn cancellation_interrupts_blocked_pump() {
        let chain = ToxicChain::new(Direction::Downstream);
        chain
            .add(Toxic::new(
                "hold",
                Direction::Downstream,
                ToxicKind::Timeout { timeout: 0 },
            ))
            .unwrap();
        let cancel = CancellationToken::new();
        let (pump, _) = pump(&chain, &cancel);

        let (mut upstream, mut source) = duplex(64);
        let (mut sink, _client) = duplex(64);
        let task = tokio::spawn(async move { pump.run(&mut source, &mut sink).await });

        upstream.write_all(b"stuck").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let end = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(end, PumpEnd::Cancelled));
    }

    #[tokio::test]
    async fn timeout_with_duration_closes_link() {
        let chain = ToxicChain::new(Direction::Downstream);
        chain
            .add(Toxic::new(
                "close",
                Direction::Downstream,
                ToxicKind::Timeout { timeout: 50 },
            ))
            .unwrap();
        let cancel = CancellationToken::new();
        let (pump, _) = pump(&chain, &cancel);

        let (_upstream, mut source) = duplex(64);
        let (mut sink, _client) = duplex(64);
        let started = std::time::Instant::now();
        let end = pump.run(&mut source, &mut sink).await;

        assert!(matches!(end, PumpEnd::Closed));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn limit_data_closes_after_budget() {
        let chain = ToxicChain::new(Direction::Upstream);
        chain
            .add(Toxic::new(
                "limit",
                Direction::Upstream,
                ToxicKind::LimitData { bytes: 3 },
            ))
            .unwrap();
        let cancel = CancellationToken::new();
        let (pump, counters) = pump(&chain, &cancel);

        let (mut client, mut source) = duplex(64);
        let (mut sink, mut server) = duplex(64);
        let task = tokio::spawn(async move { pump.run(&mut source, &mut sink).await });

        client.write_all(b"abcdef").await.unwrap();
        let end = task.await.unwrap();
        assert!(matches!(end, PumpEnd::Closed));

        let mut buf = [0u8; 8];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert_eq!(counters.get(Direction::Upstream), 3);
    }

    #[tokio::test]
    async fn slow_close_delays_shutdown() {
        let chain = ToxicChain::new(Direction::Downstream);
        chain
            .add(Toxic::new(
                "slow",
                Direction::Downstream,
                ToxicKind::SlowClose { delay: 80 },
            ))
            .unwrap();
        let cancel = CancellationToken::new();
        let (pump, _) = pump(&chain, &cancel);

        let (mut upstream, mut source) = duplex(64);
        let (mut sink, mut client) = duplex(64);
        let task = tokio::spawn(async move { pump.run(&mut source, &mut sink).await });

        let started = std::time::Instant::now();
        upstream.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(80));
        assert!(matches!(task.await.unwrap(), PumpEnd::Eof));
    }

    #[tokio::test]
    async fn registry_close_all_waits_for_tasks() {
        let registry = Arc::new(LinkRegistry::default());
        for _ in 0..3 {
            let cancel = CancellationToken::new();
            let token = cancel.clone();
            registry
                .spawn(
                    ConnectionInfo::new("p".into(), "c".into(), "u".into()),
                    Arc::new(ByteCounters::default()),
                    cancel,
                    async move { token.cancelled().await },
                )
                .await;
        }
        assert_eq!(registry.len().await, 3);

        registry.close_all().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn registry_lists_only_active_links() {
        let registry = Arc::new(LinkRegistry::default());
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let info = ConnectionInfo::new("p".into(), "c".into(), "u".into());
        let id = info.id;
        registry
            .spawn(info, Arc::new(ByteCounters::default()), cancel, async move {
                token.cancelled().await
            })
            .await;

        assert_eq!(registry.len().await, 1);
        assert!(registry.list().await.is_empty());

        registry.mark_active(id).await;
        let links = registry.list().await;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].state, ConnectionState::Active);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn panicking_link_task_is_unregistered() {
        let registry = Arc::new(LinkRegistry::default());
        registry
            .spawn(
                ConnectionInfo::new("p".into(), "c".into(), "u".into()),
                Arc::new(ByteCounters::default()),
                CancellationToken::new(),
                async { panic!("link task failure") },
            )
            .await;

        timeout(Duration::from_secs(1), async {
            while !registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}

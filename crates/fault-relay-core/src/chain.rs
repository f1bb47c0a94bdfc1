//! Ordered toxic pipelines, one per direction of a proxy.
//!
//! A chain publishes immutable snapshots through a `watch` channel. Every
//! pump holds a [`ChainReader`] that evaluates each chunk against the latest
//! snapshot and is woken when the chain is edited.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::toxic::{Direction, Schedule, Toxic, ToxicKind, ToxicUpdate};

/// Toxics applied to one direction, in insertion order.
#[derive(Debug)]
pub struct ToxicChain {
    direction: Direction,
    tx: watch::Sender<Arc<[Toxic]>>,
}

impl ToxicChain {
    pub fn new(direction: Direction) -> Self {
        let (tx, _) = watch::channel(Arc::from(Vec::new()));
        Self { direction, tx }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current toxic list.
    pub fn snapshot(&self) -> Arc<[Toxic]> {
        self.tx.borrow().clone()
    }

    pub fn get(&self, name: &str) -> Option<Toxic> {
        self.tx.borrow().iter().find(|t| t.name == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tx.borrow().iter().any(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reader for a new link.
    pub fn reader(&self) -> ChainReader {
        ChainReader::new(self.tx.subscribe())
    }

    /// Append a toxic to the end of the chain.
    pub fn add(&self, toxic: Toxic) -> Result<()> {
        if toxic.stream != self.direction {
            return Err(Error::InvalidToxic(format!(
                "toxic {} targets {} but chain is {}",
                toxic.name, toxic.stream, self.direction
            )));
        }
        toxic.validate()?;

        let mut outcome = Ok(());
        self.tx.send_if_modified(|toxics| {
            if toxics.iter().any(|t| t.name == toxic.name) {
                outcome = Err(Error::ToxicExists(toxic.name.clone()));
                return false;
            }
            let mut next = toxics.to_vec();
            next.push(toxic.clone());
            *toxics = Arc::from(next);
            true
        });
        outcome
    }

    /// Replace a toxic's parameters, keeping its position.
    pub fn update(&self, name: &str, update: &ToxicUpdate) -> Result<Toxic> {
        let mut outcome = Err(Error::ToxicNotFound(name.to_string()));
        self.tx.send_if_modified(|toxics| {
            let Some(index) = toxics.iter().position(|t| t.name == name) else {
                return false;
            };
            match update.apply_to(&toxics[index]) {
                Ok(updated) => {
                    let mut next = toxics.to_vec();
                    next[index] = updated.clone();
                    *toxics = Arc::from(next);
                    outcome = Ok(updated);
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        outcome
    }

    pub fn remove(&self, name: &str) -> Result<Toxic> {
        let mut removed = None;
        self.tx.send_if_modified(|toxics| {
            let Some(index) = toxics.iter().position(|t| t.name == name) else {
                return false;
            };
            let mut next = toxics.to_vec();
            removed = Some(next.remove(index));
            *toxics = Arc::from(next);
            true
        });
        removed.ok_or_else(|| Error::ToxicNotFound(name.to_string()))
    }

    pub fn clear(&self) {
        self.tx.send_if_modified(|toxics| {
            if toxics.is_empty() {
                return false;
            }
            *toxics = Arc::from(Vec::new());
            true
        });
    }
}

/// The upstream and downstream chains of a proxy. Toxic names are unique
/// across both.
#[derive(Debug)]
pub struct ProxyToxics {
    upstream: ToxicChain,
    downstream: ToxicChain,
    edit: Mutex<()>,
}

impl Default for ProxyToxics {
    fn default() -> Self {
        Self {
            upstream: ToxicChain::new(Direction::Upstream),
            downstream: ToxicChain::new(Direction::Downstream),
            edit: Mutex::new(()),
        }
    }
}

impl ProxyToxics {
    pub fn chain(&self, direction: Direction) -> &ToxicChain {
        match direction {
            Direction::Upstream => &self.upstream,
            Direction::Downstream => &self.downstream,
        }
    }

    /// Every toxic, upstream chain first.
    pub fn list(&self) -> Vec<Toxic> {
        self.upstream
            .snapshot()
            .iter()
            .chain(self.downstream.snapshot().iter())
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Result<Toxic> {
        self.upstream
            .get(name)
            .or_else(|| self.downstream.get(name))
            .ok_or_else(|| Error::ToxicNotFound(name.to_string()))
    }

    pub async fn add(&self, toxic: Toxic) -> Result<Toxic> {
        let _guard = self.edit.lock().await;
        if self.upstream.contains(&toxic.name) || self.downstream.contains(&toxic.name) {
            return Err(Error::ToxicExists(toxic.name));
        }
        self.chain(toxic.stream).add(toxic.clone())?;
        Ok(toxic)
    }

    pub async fn update(&self, name: &str, update: &ToxicUpdate) -> Result<Toxic> {
        let _guard = self.edit.lock().await;
        let direction = self.get(name)?.stream;
        self.chain(direction).update(name, update)
    }

    pub async fn remove(&self, name: &str) -> Result<Toxic> {
        let _guard = self.edit.lock().await;
        let direction = self.get(name)?.stream;
        self.chain(direction).remove(name)
    }

    pub async fn clear(&self) {
        let _guard = self.edit.lock().await;
        self.upstream.clear();
        self.downstream.clear();
    }
}

/// How a link ends when a link toxic fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    /// Close both sockets.
    Close,
    /// Close both sockets with a TCP reset.
    Reset,
}

/// A chunk part-way through a chain.
#[derive(Debug, Clone)]
pub struct InFlight {
    schedule: Schedule,
    applied: HashSet<String>,
}

impl InFlight {
    pub fn new(data: Bytes) -> Self {
        Self {
            schedule: Schedule::new(data),
            applied: HashSet::new(),
        }
    }
}

/// Result of running a chunk through a chain snapshot.
#[derive(Debug)]
pub enum Step {
    /// Write the schedule.
    Ready(Schedule),
    /// A blocking toxic holds the chunk until the chain changes.
    Held(InFlight),
}

#[derive(Debug, Clone, Copy)]
struct Seen {
    since: Instant,
    active: bool,
}

/// Per-link view of a chain.
#[derive(Debug)]
pub struct ChainReader {
    rx: watch::Receiver<Arc<[Toxic]>>,
    snapshot: Arc<[Toxic]>,
    seen: HashMap<String, Seen>,
    counters: HashMap<String, u64>,
    rng: StdRng,
    closed: bool,
}

impl ChainReader {
    fn new(mut rx: watch::Receiver<Arc<[Toxic]>>) -> Self {
        let snapshot = rx.borrow_and_update().clone();
        let mut reader = Self {
            rx,
            snapshot: Arc::from(Vec::new()),
            seen: HashMap::new(),
            counters: HashMap::new(),
            rng: StdRng::from_entropy(),
            closed: false,
        };
        reader.load(snapshot);
        reader
    }

    /// Use a fixed seed for toxicity and jitter rolls.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn snapshot(&self) -> &[Toxic] {
        &self.snapshot
    }

    fn load(&mut self, snapshot: Arc<[Toxic]>) {
        let now = Instant::now();
        let names: HashSet<&str> = snapshot.iter().map(|t| t.name.as_str()).collect();
        self.seen.retain(|name, _| names.contains(name.as_str()));
        self.counters.retain(|name, _| names.contains(name.as_str()));
        for toxic in snapshot.iter() {
            if !toxic.kind.is_chunk_toxic() && !self.seen.contains_key(&toxic.name) {
                let active = toxic.rolls(&mut self.rng);
                self.seen.insert(
                    toxic.name.clone(),
                    Seen {
                        since: now,
                        active,
                    },
                );
            }
        }
        self.snapshot = snapshot;
    }

    /// Wait until the chain is edited and load the new snapshot. Never
    /// resolves once the chain is gone.
    pub async fn changed(&mut self) {
        if self.closed || self.rx.changed().await.is_err() {
            self.closed = true;
            return std::future::pending().await;
        }
        let snapshot = self.rx.borrow_and_update().clone();
        self.load(snapshot);
    }

    fn is_active(&self, toxic: &Toxic) -> bool {
        self.seen.get(&toxic.name).is_some_and(|s| s.active)
    }

    /// Whether an active timeout toxic stops this direction.
    pub fn is_blocked(&self) -> bool {
        self.snapshot
            .iter()
            .any(|t| matches!(t.kind, ToxicKind::Timeout { .. }) && self.is_active(t))
    }

    /// Earliest time a link toxic ends the link.
    pub fn deadline(&self) -> Option<(Instant, Fate)> {
        self.snapshot
            .iter()
            .filter(|t| self.is_active(t))
            .filter_map(|t| {
                let since = self.seen.get(&t.name)?.since;
                match t.kind {
                    ToxicKind::Timeout { timeout } if timeout > 0 => {
                        Some((since + Duration::from_millis(timeout), Fate::Close))
                    }
                    ToxicKind::ResetConnection { timeout } => {
                        Some((since + Duration::from_millis(timeout), Fate::Reset))
                    }
                    _ => None,
                }
            })
            .min_by_key(|(at, _)| *at)
    }

    /// Delay to apply before forwarding a close.
    pub fn close_delay(&self) -> Duration {
        self.snapshot
            .iter()
            .filter(|t| self.is_active(t))
            .filter_map(|t| match t.kind {
                ToxicKind::SlowClose { delay } => Some(Duration::from_millis(delay)),
                _ => None,
            })
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Run a chunk through the current snapshot. Evaluation halts at the
    /// first active timeout toxic; toxics already applied to the chunk are
    /// skipped when it is re-run.
    pub fn process(&mut self, mut chunk: InFlight) -> Step {
        let snapshot = self.snapshot.clone();
        for toxic in snapshot.iter() {
            if chunk.applied.contains(&toxic.name) {
                continue;
            }
            if matches!(toxic.kind, ToxicKind::Timeout { .. }) && self.is_active(toxic) {
                return Step::Held(chunk);
            }
            if toxic.kind.is_chunk_toxic() && toxic.rolls(&mut self.rng) {
                toxic.apply(&mut chunk.schedule, &mut self.counters, &mut self.rng);
            }
            chunk.applied.insert(toxic.name.clone());
        }
        Step::Ready(chunk.schedule)
    }
}

//! Toxic definitions and their effect on a chunk of proxied bytes.
//!
//! Chunk toxics (latency, bandwidth, slicer, limit_data) turn a chunk into a
//! [`Schedule`] of delayed segments. Link toxics (timeout, reset_connection,
//! slow_close) act on the connection as a whole and are interpreted by the
//! pump in [`crate::link`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Direction of a byte stream through a proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to upstream.
    Upstream,
    /// Upstream to client.
    #[default]
    Downstream,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upstream" => Ok(Direction::Upstream),
            "downstream" => Ok(Direction::Downstream),
            other => Err(Error::InvalidToxic(format!("unknown stream: {}", other))),
        }
    }
}

/// Kind-specific toxic parameters. Durations are milliseconds unless noted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "attributes", rename_all = "snake_case")]
pub enum ToxicKind {
    /// Delay every chunk by `latency ± jitter`.
    Latency {
        #[serde(default)]
        latency: u64,
        #[serde(default)]
        jitter: u64,
    },
    /// Cap throughput to `rate` KB/s.
    Bandwidth { rate: u64 },
    /// Stop forwarding; close the link after `timeout` unless it is 0.
    Timeout {
        #[serde(default)]
        timeout: u64,
    },
    /// Tear the link down with a TCP reset after `timeout`.
    ResetConnection {
        #[serde(default)]
        timeout: u64,
    },
    /// Delay the close of the destination by `delay`.
    SlowClose {
        #[serde(default)]
        delay: u64,
    },
    /// Split chunks into `average_size ± size_variation` byte slices,
    /// `delay` microseconds apart.
    Slicer {
        average_size: usize,
        #[serde(default)]
        size_variation: usize,
        #[serde(default)]
        delay: u64,
    },
    /// Close the link once `bytes` bytes have passed.
    LimitData { bytes: u64 },
}

impl ToxicKind {
    /// Build a kind from its wire type name and attribute object.
    ///
    /// Accepts `reset_peer` for `reset_connection` and the `_ms`/`_kbps`
    /// suffixed attribute names.
    pub fn from_parts(kind: &str, attributes: Value) -> Result<Self> {
        let kind = canonical_kind(kind);
        let attributes = match attributes {
            Value::Null => Map::new(),
            Value::Object(map) => normalize_attributes(map),
            other => {
                return Err(Error::InvalidToxic(format!(
                    "attributes must be an object, got {}",
                    other
                )))
            }
        };

        let mut doc = Map::new();
        doc.insert("type".into(), Value::String(kind.to_string()));
        doc.insert("attributes".into(), Value::Object(attributes));

        let parsed: ToxicKind = serde_json::from_value(Value::Object(doc))
            .map_err(|e| Error::InvalidToxic(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Wire name of the kind.
    pub fn type_name(&self) -> &'static str {
        match self {
            ToxicKind::Latency { .. } => "latency",
            ToxicKind::Bandwidth { .. } => "bandwidth",
            ToxicKind::Timeout { .. } => "timeout",
            ToxicKind::ResetConnection { .. } => "reset_connection",
            ToxicKind::SlowClose { .. } => "slow_close",
            ToxicKind::Slicer { .. } => "slicer",
            ToxicKind::LimitData { .. } => "limit_data",
        }
    }

    /// Attributes as a JSON object.
    pub fn attributes(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut doc)) => match doc.remove("attributes") {
                Some(Value::Object(attributes)) => attributes,
                _ => Map::new(),
            },
            _ => Map::new(),
        }
    }

    /// Return a copy with `patch` merged over the current attributes.
    pub fn merged(&self, patch: Value) -> Result<Self> {
        let patch = match patch {
            Value::Object(map) => normalize_attributes(map),
            Value::Null => Map::new(),
            other => {
                return Err(Error::InvalidToxic(format!(
                    "attributes must be an object, got {}",
                    other
                )))
            }
        };
        let mut attributes = self.attributes();
        attributes.extend(patch);
        Self::from_parts(self.type_name(), Value::Object(attributes))
    }

    fn validate(&self) -> Result<()> {
        match self {
            ToxicKind::Bandwidth { rate: 0 } => {
                Err(Error::InvalidToxic("bandwidth rate must be positive".into()))
            }
            ToxicKind::Slicer { average_size: 0, .. } => {
                Err(Error::InvalidToxic("slicer average_size must be positive".into()))
            }
            ToxicKind::Slicer {
                average_size,
                size_variation,
                ..
            } if size_variation >= average_size => Err(Error::InvalidToxic(
                "slicer size_variation must be smaller than average_size".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Whether the kind acts on individual chunks rather than the whole link.
    pub fn is_chunk_toxic(&self) -> bool {
        matches!(
            self,
            ToxicKind::Latency { .. }
                | ToxicKind::Bandwidth { .. }
                | ToxicKind::Slicer { .. }
                | ToxicKind::LimitData { .. }
        )
    }
}

fn canonical_kind(kind: &str) -> &str {
    match kind {
        "reset_peer" => "reset_connection",
        other => other,
    }
}

fn normalize_attributes(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| {
            let key = match key.as_str() {
                "latency_ms" => "latency".to_string(),
                "jitter_ms" => "jitter".to_string(),
                "timeout_ms" => "timeout".to_string(),
                "delay_ms" => "delay".to_string(),
                "rate_kbps" => "rate".to_string(),
                _ => key,
            };
            (key, value)
        })
        .collect()
}

/// A named fault-injection rule on one direction of a proxy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Toxic {
    /// Unique name within the proxy.
    pub name: String,

    /// Direction the toxic applies to.
    pub stream: Direction,

    /// Probability in `[0, 1]` that the toxic applies.
    pub toxicity: f32,

    /// Kind and parameters.
    #[serde(flatten)]
    pub kind: ToxicKind,
}

impl Toxic {
    /// Create a toxic with toxicity 1.0.
    pub fn new(name: impl Into<String>, stream: Direction, kind: ToxicKind) -> Self {
        Self {
            name: name.into(),
            stream,
            toxicity: 1.0,
            kind,
        }
    }

    pub fn with_toxicity(mut self, toxicity: f32) -> Self {
        self.toxicity = toxicity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidToxic("toxic name is required".into()));
        }
        if !(0.0..=1.0).contains(&self.toxicity) {
            return Err(Error::InvalidToxic(format!(
                "toxicity must be within [0, 1], got {}",
                self.toxicity
            )));
        }
        self.kind.validate()
    }

    /// Roll the toxicity die.
    pub fn rolls<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        self.toxicity >= 1.0 || rng.gen::<f32>() < self.toxicity
    }

    /// Apply a chunk toxic to the schedule of a chunk. Link toxics leave the
    /// schedule untouched.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        schedule: &mut Schedule,
        counters: &mut HashMap<String, u64>,
        rng: &mut R,
    ) {
        match self.kind {
            ToxicKind::Latency { latency, jitter } => {
                for segment in &mut schedule.segments {
                    segment.delay += jittered(latency, jitter, rng);
                }
            }
            ToxicKind::Bandwidth { rate } => {
                let max_slice = (rate as usize).saturating_mul(100).max(1);
                schedule.split(|segment| {
                    let mut pieces = Vec::new();
                    let mut rest = segment.data;
                    let mut delay = segment.delay;
                    while !rest.is_empty() {
                        let piece = rest.split_to(rest.len().min(max_slice));
                        delay += Duration::from_micros(piece.len() as u64 * 1000 / rate);
                        pieces.push(Segment { delay, data: piece });
                        delay = Duration::ZERO;
                    }
                    pieces
                });
            }
            ToxicKind::Slicer {
                average_size,
                size_variation,
                delay,
            } => {
                schedule.split(|segment| {
                    let mut pieces = Vec::new();
                    let mut rest = segment.data;
                    let mut first_delay = Some(segment.delay);
                    while !rest.is_empty() {
                        let size = if size_variation == 0 {
                            average_size
                        } else {
                            rng.gen_range(
                                average_size - size_variation..=average_size + size_variation,
                            )
                        };
                        let piece = rest.split_to(rest.len().min(size));
                        let delay = first_delay
                            .take()
                            .unwrap_or_else(|| Duration::from_micros(delay));
                        pieces.push(Segment { delay, data: piece });
                    }
                    pieces
                });
            }
            ToxicKind::LimitData { bytes } => {
                let passed = counters.entry(self.name.clone()).or_insert(0);
                let mut budget = bytes.saturating_sub(*passed);
                for segment in &mut schedule.segments {
                    let len = segment.data.len() as u64;
                    if len >= budget {
                        segment.data.truncate(budget as usize);
                        budget = 0;
                    } else {
                        budget -= len;
                    }
                }
                schedule.segments.retain(|s| !s.data.is_empty());
                *passed = bytes - budget;
                if budget == 0 {
                    schedule.close_after = true;
                }
            }
            ToxicKind::Timeout { .. }
            | ToxicKind::ResetConnection { .. }
            | ToxicKind::SlowClose { .. } => {}
        }
    }
}

fn jittered<R: Rng + ?Sized>(base: u64, jitter: u64, rng: &mut R) -> Duration {
    if jitter == 0 {
        return Duration::from_millis(base);
    }
    let offset = rng.gen_range(0..=jitter * 2) as i64 - jitter as i64;
    Duration::from_millis((base as i64 + offset).max(0) as u64)
}

/// A piece of a chunk to be written after `delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub delay: Duration,
    pub data: Bytes,
}

/// How one chunk is written to the destination.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schedule {
    pub segments: Vec<Segment>,

    /// Close the link once the segments are written.
    pub close_after: bool,
}

impl Schedule {
    pub fn new(data: Bytes) -> Self {
        Self {
            segments: vec![Segment {
                delay: Duration::ZERO,
                data,
            }],
            close_after: false,
        }
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn split(&mut self, mut f: impl FnMut(Segment) -> Vec<Segment>) {
        let segments = std::mem::take(&mut self.segments);
        self.segments = segments.into_iter().flat_map(&mut f).collect();
    }
}

/// Body of a toxic creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct ToxicRequest {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub stream: Option<Direction>,

    #[serde(default)]
    pub toxicity: Option<f32>,

    #[serde(default)]
    pub attributes: Value,
}

impl ToxicRequest {
    /// Validate the request and build the toxic. The name defaults to
    /// `<type>_<stream>`.
    pub fn into_toxic(self) -> Result<Toxic> {
        let kind = ToxicKind::from_parts(&self.kind, self.attributes)?;
        let stream = self.stream.unwrap_or_default();
        let name = self
            .name
            .unwrap_or_else(|| format!("{}_{}", kind.type_name(), stream));
        let toxic = Toxic {
            name,
            stream,
            toxicity: self.toxicity.unwrap_or(1.0),
            kind,
        };
        toxic.validate()?;
        Ok(toxic)
    }
}

/// Body of a toxic update request. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToxicUpdate {
    #[serde(default)]
    pub toxicity: Option<f32>,

    #[serde(default)]
    pub attributes: Option<Value>,
}

impl ToxicUpdate {
    /// Produce the updated toxic, keeping name and stream.
    pub fn apply_to(&self, toxic: &Toxic) -> Result<Toxic> {
        let kind = match &self.attributes {
            Some(patch) => toxic.kind.merged(patch.clone())?,
            None => toxic.kind.clone(),
        };
        let updated = Toxic {
            name: toxic.name.clone(),
            stream: toxic.stream,
            toxicity: self.toxicity.unwrap_or(toxic.toxicity),
            kind,
        };
        updated.validate()?;
        Ok(updated)
    }
}

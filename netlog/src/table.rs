//! In-flight flow state.
//!
//! The table is split into independently locked shards picked by key hash.
//! A shard lock covers one key's read-modify-write or one shard scan, and is
//! never held across an identity lookup.

use std::{
    borrow::Cow,
    collections::{hash_map::DefaultHasher, hash_map::Entry, HashMap},
    hash::{Hash, Hasher},
    net::Ipv4Addr,
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::debug;
use netlog_common::{Direction, FlowKey, Packet};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
    identity::{Attribution, Resolver},
    record::FlowRecord,
    window::FlushPolicy,
};

pub const FLOW_SHARDS: usize = 64;

/// Mutable aggregate for one flow key.
#[derive(Clone, Debug)]
pub struct FlowAggregate {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Local clock of the last update; only the reaper looks at it.
    pub last_seen: Instant,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: Cow<'static, str>,
    pub port: u16,
    pub total_bytes: u64,
    pub packet_count: u64,
    pub namespace: String,
    pub name: String,
    pub direction: Direction,
}

impl FlowAggregate {
    fn new(key: &FlowKey, packet: &Packet, attribution: Attribution, now: Instant) -> Self {
        Self {
            start: packet.timestamp,
            end: packet.timestamp,
            last_seen: now,
            source: key.src,
            destination: key.dst,
            protocol: key.protocol.clone(),
            port: key.src_port,
            total_bytes: packet.byte_length as u64,
            packet_count: 1,
            namespace: attribution.namespace,
            name: attribution.name,
            direction: attribution.direction,
        }
    }

    fn record(&mut self, packet: &Packet, now: Instant) {
        if packet.timestamp > self.end {
            self.end = packet.timestamp;
        }
        self.total_bytes = self.total_bytes.wrapping_add(packet.byte_length as u64);
        self.packet_count = self.packet_count.wrapping_add(1);
        self.last_seen = now;
    }

    pub fn duration(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or_default()
    }

    pub fn snapshot(&self) -> FlowRecord {
        FlowRecord {
            start: self.start,
            end: self.end,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            direction: self.direction,
            source: self.source,
            destination: self.destination,
            protocol: self.protocol.clone(),
            port: self.port,
            total_bytes: self.total_bytes,
            packets: self.packet_count,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Updated,
}

pub struct FlowTable {
    shards: Vec<Mutex<HashMap<FlowKey, FlowAggregate>>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::with_shards(FLOW_SHARDS)
    }

    pub fn with_shards(count: usize) -> Self {
        let mut shards = Vec::with_capacity(count.max(1));
        for _ in 0..count.max(1) {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self { shards }
    }

    fn shard(&self, key: &FlowKey) -> &Mutex<HashMap<FlowKey, FlowAggregate>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Folds `packet` into the flow for `key`, creating and attributing the
    /// flow on first sight.
    pub async fn upsert(&self, key: FlowKey, packet: &Packet, resolver: &Resolver) -> Upsert {
        {
            let mut shard = self.shard(&key).lock();
            if let Some(flow) = shard.get_mut(&key) {
                flow.record(packet, Instant::now());
                return Upsert::Updated;
            }
        }

        let attribution = Attribution::resolve(resolver, key.src, key.dst).await;

        let now = Instant::now();
        let mut shard = self.shard(&key).lock();
        match shard.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().record(packet, now);
                Upsert::Updated
            }
            Entry::Vacant(entry) => {
                debug!(
                    "tracking {} ({} {})",
                    entry.key(),
                    attribution.direction,
                    attribution.namespace
                );
                let flow = FlowAggregate::new(entry.key(), packet, attribution, now);
                entry.insert(flow);
                Upsert::Created
            }
        }
    }

    /// Removes and returns every flow the policy considers mature.
    pub fn drain_matured(&self, policy: &FlushPolicy) -> Vec<FlowRecord> {
        let mut matured = Vec::new();
        for shard in &self.shards {
            shard.lock().retain(|_, flow| {
                if policy.is_mature(flow) {
                    matured.push(flow.snapshot());
                    false
                } else {
                    true
                }
            });
        }
        matured
    }

    /// Drops flows not updated within `max_idle`, returning how many went.
    pub fn drain_stale(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut guard = shard.lock();
            let before = guard.len();
            guard.retain(|_, flow| now.saturating_duration_since(flow.last_seen) <= max_idle);
            removed += before - guard.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.lock().is_empty())
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

//! Resolution of IP addresses to the workload that owns them.
//!
//! Lookups go to a fast cache first and fall back to the authoritative
//! directory on a miss, writing the answer back into the cache. Every backend
//! call carries a deadline so a slow backend degrades to "unattributed"
//! instead of stalling ingestion.

mod cache;
mod directory;

pub use cache::MemoryCache;
pub use directory::StaticDirectory;

use std::{future::Future, net::Ipv4Addr, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, warn};
use netlog_common::Direction;
use thiserror::Error;
use tokio::time;

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Logical owner of an address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentityRecord {
    pub namespace: String,
    pub name: String,
}

impl IdentityRecord {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// Failure reported by a cache or directory backend.
#[derive(Debug, Error)]
#[error("{backend} unavailable: {reason}")]
pub struct BackendError {
    pub backend: &'static str,
    pub reason: String,
}

impl BackendError {
    pub fn new(backend: &'static str, reason: impl Into<String>) -> Self {
        Self {
            backend,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no identity for {0}")]
    NotFound(String),

    #[error("invalid identifier format: {0}")]
    Malformed(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("{0} lookup timed out")]
    Timeout(&'static str),
}

#[async_trait]
pub trait IdentityCache: Send + Sync {
    /// `Ok(None)` on a miss.
    async fn get(&self, ip: &str) -> Result<Option<IdentityRecord>, BackendError>;

    async fn set(&self, ip: &str, record: &IdentityRecord) -> Result<(), BackendError>;
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Returns the `<namespace>-<name>` identifier registered for `ip`.
    async fn find_by_ip(&self, ip: &str) -> Result<Option<String>, BackendError>;
}

/// Splits an identifier on its first hyphen.
pub fn parse_identifier(identifier: &str) -> Result<IdentityRecord, ResolveError> {
    identifier
        .split_once('-')
        .map(|(namespace, name)| IdentityRecord::new(namespace, name))
        .ok_or_else(|| ResolveError::Malformed(identifier.to_string()))
}

pub struct Resolver {
    cache: Arc<dyn IdentityCache>,
    directory: Arc<dyn IdentityDirectory>,
    timeout: Duration,
}

impl Resolver {
    pub fn new(cache: Arc<dyn IdentityCache>, directory: Arc<dyn IdentityDirectory>) -> Self {
        Self {
            cache,
            directory,
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn resolve(&self, ip: &str) -> Result<IdentityRecord, ResolveError> {
        match self.bounded("cache", self.cache.get(ip)).await {
            Ok(Ok(Some(record))) if !record.namespace.is_empty() => return Ok(record),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => debug!("cache read for {ip} failed, falling back: {err}"),
            Err(err) => debug!("{err} for {ip}, falling back"),
        }

        let identifier = self
            .bounded("directory", self.directory.find_by_ip(ip))
            .await??
            .ok_or_else(|| ResolveError::NotFound(ip.to_string()))?;
        let record = parse_identifier(&identifier)?;

        match self.bounded("cache", self.cache.set(ip, &record)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("failed to cache identity for {ip}: {err}"),
            Err(err) => warn!("failed to cache identity for {ip}: {err}"),
        }
        Ok(record)
    }

    async fn bounded<T>(
        &self,
        backend: &'static str,
        call: impl Future<Output = T>,
    ) -> Result<T, ResolveError> {
        time::timeout(self.timeout, call)
            .await
            .map_err(|_| ResolveError::Timeout(backend))
    }
}

/// Workload ownership of a flow, fixed when the flow is first seen.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attribution {
    pub namespace: String,
    pub name: String,
    pub direction: Direction,
}

impl Attribution {
    /// Tries the source first, then the destination.
    pub async fn resolve(resolver: &Resolver, src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        for (addr, direction) in [(src, Direction::Outbound), (dst, Direction::Inbound)] {
            match resolver.resolve(&addr.to_string()).await {
                Ok(record) => {
                    return Self {
                        namespace: record.namespace,
                        name: record.name,
                        direction,
                    }
                }
                Err(ResolveError::NotFound(_)) => {}
                Err(err @ ResolveError::Malformed(_)) => warn!("{addr}: {err}"),
                Err(err) => debug!("{addr}: {err}"),
            }
        }
        Self::default()
    }

    pub fn is_attributed(&self) -> bool {
        !self.namespace.is_empty()
    }
}

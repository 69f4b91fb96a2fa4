//! Peer discovery.
//!
//! The cluster asks its [`Discovery`] for peer addresses exactly once, at
//! startup. [`Registry`] is an in-memory stand-in for a shared key-value store
//! where live servers publish `servers:<id>` entries with a TTL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::RegistryConfig;
use crate::raft::timer::{Timer, TimerDuration};
use crate::raft::NodeId;

const KEY_PREFIX: &str = "servers:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Addresses of the currently known peers, excluding this member.
    async fn discover(&self) -> Result<Vec<String>, DiscoveryError>;
}

/// A fixed list of peer addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<String>,
}

impl StaticDiscovery {
    pub fn new<I, S>(peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            peers: peers.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<String>, DiscoveryError> {
        Ok(self.peers.clone())
    }
}

#[derive(Debug)]
struct Entry {
    address: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct RegistryInner {
    entries: HashMap<String, Entry>,
    unavailable: bool,
}

/// Shared in-memory key-value registry with expiring entries. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `key → address`, expiring after `ttl`.
    pub fn publish(&self, key: &str, address: &str, ttl: Duration) {
        self.lock().entries.insert(
            key.to_string(),
            Entry {
                address: address.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Push the expiry of a live entry `ttl` into the future.
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &str) {
        self.lock().entries.remove(key);
    }

    /// Addresses of live entries whose key starts with `prefix`, ordered by key.
    pub fn live(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.entries.retain(|_, entry| entry.expires_at > now);

        let mut live: Vec<(&String, &Entry)> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .collect();
        live.sort_by(|a, b| a.0.cmp(b.0));
        live.into_iter().map(|(_, e)| e.address.clone()).collect()
    }

    /// Simulate an outage: lookups fail until called again with `true`.
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    fn is_available(&self) -> bool {
        !self.lock().unavailable
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Discovery through a [`Registry`], publishing this member while bound.
pub struct RegistryDiscovery {
    registry: Registry,
    config: RegistryConfig,
    key: String,
    address: String,
    keepalive: Mutex<Option<Timer>>,
}

impl RegistryDiscovery {
    pub fn new(registry: Registry, id: NodeId, address: impl Into<String>, config: RegistryConfig) -> Self {
        Self {
            registry,
            config,
            key: format!("{}{}", KEY_PREFIX, id),
            address: address.into(),
            keepalive: Mutex::new(None),
        }
    }

    /// Publish this member and keep the entry alive until [`RegistryDiscovery::unbind`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(&self) {
        let ttl = self.config.ttl();
        self.registry.publish(&self.key, &self.address, ttl);

        let registry = self.registry.clone();
        let key = self.key.clone();
        let mut keepalive = Timer::new(
            TimerDuration::Fixed(self.config.keepalive_interval()),
            move |_| {
                registry.expire(&key, ttl);
            },
        );
        keepalive.indefinite();

        if let Some(mut previous) = self.keepalive_slot().replace(keepalive) {
            previous.cancel();
        }
        tracing::debug!(key = %self.key, address = %self.address, "Published to registry");
    }

    pub fn unbind(&self) {
        if let Some(mut keepalive) = self.keepalive_slot().take() {
            keepalive.cancel();
        }
        self.registry.remove(&self.key);
        tracing::debug!(key = %self.key, "Removed from registry");
    }

    fn keepalive_slot(&self) -> MutexGuard<'_, Option<Timer>> {
        self.keepalive.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn discover(&self) -> Result<Vec<String>, DiscoveryError> {
        if !self.registry.is_available() {
            return Err(DiscoveryError::Unavailable(
                "registry is not reachable".to_string(),
            ));
        }
        Ok(self
            .registry
            .live(KEY_PREFIX)
            .into_iter()
            .filter(|address| *address != self.address)
            .collect())
    }
}

//! Fixed-capacity registry of configured connections.
//!
//! The registry is owned by the dispatcher task, which is the only code that
//! mutates it. Everyone else reads published [`RegistrySnapshot`]s.

pub mod connection;

use std::collections::HashMap;

use serde::Serialize;

use crate::config::{Config, ConnectionConfig};
use crate::error::Error;
use crate::manage::channel::ChannelId;

pub use connection::{AuthOutcome, ConnId, ConnState, Connection, ConnectionSnapshot};

/// Reachability of the privileged helper service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// No helper is configured or it refused the socket.
    Unreachable,
    Disconnected,
    /// A dial to the helper socket is in progress.
    Connecting,
    Connected,
}

/// All known connections, stored in a fixed-size arena so a [`ConnId`] stays
/// valid for the process lifetime.
#[derive(Debug)]
pub struct Registry {
    slots: Vec<Connection>,
    capacity: usize,
    by_channel: HashMap<ChannelId, ConnId>,
    pub service_state: ServiceState,
}

impl Registry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            by_channel: HashMap::new(),
            service_state: ServiceState::Unreachable,
        }
    }

    /// Build the registry from config, one slot per `[[connection]]` entry.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let mut registry = Self::with_capacity(config.registry.max_connections);
        if config.service.is_some() {
            registry.service_state = ServiceState::Disconnected;
        }
        for conn in &config.connections {
            registry.add(conn, &config.launcher.log_dir)?;
        }
        Ok(registry)
    }

    /// Admit a new connection. Fails once the configured capacity is reached;
    /// existing entries are never evicted.
    pub fn add(&mut self, cfg: &ConnectionConfig, log_dir: &str) -> Result<ConnId, Error> {
        if self.slots.len() >= self.capacity {
            return Err(Error::RegistryFull(self.capacity));
        }
        let id = ConnId(self.slots.len());
        self.slots.push(Connection::new(id, cfg, log_dir));
        Ok(id)
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.slots.get(id.0)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots.get_mut(id.0)
    }

    pub fn by_name(&self, name: &str) -> Option<ConnId> {
        self.slots.iter().find(|c| c.name == name).map(|c| c.id)
    }

    /// Associate a channel token with a connection for the lifetime of one
    /// management session.
    pub fn bind_channel(&mut self, channel: ChannelId, id: ConnId) {
        self.by_channel.insert(channel, id);
    }

    pub fn unbind_channel(&mut self, channel: ChannelId) {
        self.by_channel.remove(&channel);
    }

    /// Resolve a channel event to its connection. A stale token (session
    /// already torn down) resolves to `None` and the event is dropped.
    pub fn lookup_by_channel(&mut self, channel: ChannelId) -> Option<&mut Connection> {
        let id = *self.by_channel.get(&channel)?;
        self.slots.get_mut(id.0)
    }

    pub fn count_in_state(&self, state: ConnState) -> usize {
        self.slots.iter().filter(|c| c.state == state).count()
    }

    /// Connections that are not settled in `disconnected`/`timedout`.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|c| c.state.is_active()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.slots.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            connections: self.slots.iter().map(Connection::snapshot).collect(),
            service_state: self.service_state,
        }
    }
}

/// Point-in-time view of the whole registry, published over a watch channel.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub connections: Vec<ConnectionSnapshot>,
    pub service_state: ServiceState,
}

impl Default for RegistrySnapshot {
    fn default() -> Self {
        Self {
            connections: Vec::new(),
            service_state: ServiceState::Unreachable,
        }
    }
}

//! One configured tunnel connection and its lifecycle state machine.
//!
//! A [`Connection`] is the authoritative record for a single tunnel: identity,
//! lifecycle state, live management session, counters and timers. All
//! mutation happens on the dispatcher task; workers only observe snapshots.
//!
//! The transition methods here are pure state updates. I/O that a transition
//! implies (sending a signal, killing a process) is performed by the
//! dispatcher after the method returns.

use std::net::SocketAddr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::config::{ConnectionConfig, LaunchMode, ProxyKind};
use crate::manage::channel::{ChannelId, ChannelWriter};
use crate::manage::command::{CommandQueue, Secret};

/// Stable identity of a connection within the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub usize);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Reconnecting,
    Connected,
    Disconnecting,
    Suspending,
    Suspended,
    Resuming,
    TimedOut,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Reconnecting => "reconnecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Suspending => "suspending",
            Self::Suspended => "suspended",
            Self::Resuming => "resuming",
            Self::TimedOut => "timedout",
        }
    }

    /// A session (process and/or channel) exists in this state.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Disconnected | Self::TimedOut)
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live management-channel session state, embedded in [`Connection`].
///
/// `connected` tracks the channel itself, which comes up before the tunnel
/// finishes negotiating — distinct from the connection's own state.
#[derive(Debug, Default)]
pub struct ManagementSession {
    /// Write half of the open channel. `None` until the process connects back.
    pub writer: Option<ChannelWriter>,
    /// Channel token, assigned at listen time (before the writer exists).
    pub channel_id: Option<ChannelId>,
    pub peer_addr: Option<SocketAddr>,
    /// Inactivity deadline while mid-transition.
    pub deadline: Option<Instant>,
    /// Cached single-use password, consumed by the first `>PASSWORD:` prompt.
    pub password: Option<Secret>,
    pub queue: CommandQueue,
    pub connected: bool,
}

impl ManagementSession {
    /// Tear down the session: discard the queue (wiping secrets), drop the
    /// cached password and the writer. The caller unbinds the channel id from
    /// the registry.
    pub fn release(&mut self) {
        self.queue.drain();
        self.password = None;
        self.writer = None;
        self.channel_id = None;
        self.peer_addr = None;
        self.deadline = None;
        self.connected = false;
    }
}

/// Outcome of counting a failed password attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Under the limit — resubmit on the next prompt.
    Retry,
    /// Limit reached — force disconnect, do not prompt again.
    LimitReached,
}

/// One configured tunnel definition plus its live session data.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub name: String,
    pub config_file: String,
    pub log_path: String,
    pub auto_connect: bool,
    pub launch: LaunchMode,
    /// Credentials from config, cached into the session on each start.
    pub username: Option<String>,
    config_password: Option<String>,

    pub state: ConnState,
    /// Assigned tunnel address. Non-empty if and only if `state == Connected`.
    pub ip: Option<String>,
    pub failed_psw_attempts: u32,
    /// Set on entry to `Connected` (once per episode), cleared on entry to
    /// `Disconnected`.
    pub connected_since: Option<SystemTime>,
    /// Proxy type in effect for the running process.
    pub proxy_type: Option<ProxyKind>,

    pub manage: ManagementSession,

    /// Managed process id (direct launch) or helper-reported pid.
    pub pid: Option<u32>,
    /// Peer software version, captured via the `version` command.
    pub peer_version: Option<String>,
    /// Dynamic challenge string from a `CRV1:` auth failure.
    pub dynamic_challenge: Option<String>,
    /// Last user-visible failure, shown by the presentation layer.
    pub last_error: Option<String>,

    /// A stop was requested; process exit is expected.
    pub stop_requested: bool,
    /// Hard-kill deadline after a stop request.
    pub grace_deadline: Option<Instant>,
}

impl Connection {
    pub fn new(id: ConnId, cfg: &ConnectionConfig, log_dir: &str) -> Self {
        Self {
            id,
            name: cfg.name.clone(),
            config_file: cfg.config_file.clone(),
            log_path: cfg.log_path(log_dir),
            auto_connect: cfg.auto_connect,
            launch: cfg.launch,
            username: cfg.username.clone(),
            config_password: cfg.password.clone(),
            state: ConnState::Disconnected,
            ip: None,
            failed_psw_attempts: 0,
            connected_since: None,
            proxy_type: None,
            manage: ManagementSession::default(),
            pid: None,
            peer_version: None,
            dynamic_challenge: None,
            last_error: None,
            stop_requested: false,
            grace_deadline: None,
        }
    }

    /// Start requested: `disconnected`/`timedout` → `connecting`.
    /// Caches credentials into the session. Returns `false` from any other
    /// state (start is not valid mid-session).
    pub fn begin_connecting(&mut self, deadline: Instant) -> bool {
        if self.state.is_active() {
            return false;
        }
        self.state = ConnState::Connecting;
        self.stop_requested = false;
        self.grace_deadline = None;
        self.last_error = None;
        self.dynamic_challenge = None;
        self.failed_psw_attempts = 0;
        self.manage.deadline = Some(deadline);
        self.manage.password = self.config_password.as_deref().map(Secret::new);
        true
    }

    /// The management channel accepted the process's connection.
    pub fn on_channel_up(&mut self, peer: SocketAddr) {
        self.manage.connected = true;
        self.manage.peer_addr = Some(peer);
    }

    /// Channel activity observed: push the inactivity deadline out.
    pub fn touch(&mut self, deadline: Instant) {
        if self.manage.deadline.is_some() {
            self.manage.deadline = Some(deadline);
        }
    }

    /// Tunnel fully up with an assigned address. Ignored once a stop or
    /// suspend is underway: a late `CONNECTED` notice must not yank the
    /// machine out of `disconnecting`/`suspending`.
    pub fn on_tunnel_up(&mut self, ip: String, now: SystemTime) {
        if !matches!(
            self.state,
            ConnState::Connecting
                | ConnState::Reconnecting
                | ConnState::Resuming
                | ConnState::Connected
        ) {
            return;
        }
        self.state = ConnState::Connected;
        self.ip = Some(ip);
        self.failed_psw_attempts = 0;
        // Once per episode: resume reattach keeps the original timestamp.
        if self.connected_since.is_none() {
            self.connected_since = Some(now);
        }
        // Steady state — no inactivity deadline while connected.
        self.manage.deadline = None;
    }

    /// Process-initiated recoverable restart. The soft-restart that a suspend
    /// triggers also announces `RECONNECTING`; the deadline is armed only when
    /// the state actually moves, so a parked tunnel never carries one.
    pub fn on_reconnecting(&mut self, deadline: Instant) {
        if matches!(self.state, ConnState::Connecting | ConnState::Connected) {
            self.state = ConnState::Reconnecting;
            self.ip = None;
            self.manage.deadline = Some(deadline);
        }
    }

    /// Stop requested. Returns `false` when already `disconnected` (a no-op
    /// per the idempotence contract).
    pub fn begin_stop(&mut self, grace_deadline: Instant) -> bool {
        if !self.state.is_active() {
            return false;
        }
        self.state = ConnState::Disconnecting;
        self.stop_requested = true;
        self.grace_deadline = Some(grace_deadline);
        self.ip = None;
        self.manage.deadline = None;
        true
    }

    /// Count a failed password attempt against the configured limit.
    pub fn on_auth_failed(&mut self, max_attempts: u32, challenge: Option<String>) -> AuthOutcome {
        self.failed_psw_attempts += 1;
        if let Some(cr) = challenge {
            self.dynamic_challenge = Some(cr);
        }
        if self.failed_psw_attempts >= max_attempts {
            AuthOutcome::LimitReached
        } else {
            AuthOutcome::Retry
        }
    }

    /// Whether another password prompt may still be answered.
    pub fn may_submit_password(&self, max_attempts: u32) -> bool {
        self.failed_psw_attempts < max_attempts && self.state.is_active()
    }

    /// Host suspend requested. Only meaningful while `connected`.
    pub fn begin_suspend(&mut self) -> bool {
        if self.state != ConnState::Connected {
            return false;
        }
        self.state = ConnState::Suspending;
        self.ip = None;
        self.manage.deadline = None;
        true
    }

    /// The suspend command was acknowledged. A suspended tunnel is parked
    /// deliberately; no inactivity deadline may remain armed.
    pub fn on_suspend_ack(&mut self) {
        if self.state == ConnState::Suspending {
            self.state = ConnState::Suspended;
            self.manage.deadline = None;
        }
    }

    /// Host resume requested: `suspended` → `resuming`.
    pub fn begin_resume(&mut self, deadline: Instant) -> bool {
        if self.state != ConnState::Suspended {
            return false;
        }
        self.state = ConnState::Resuming;
        self.manage.deadline = Some(deadline);
        true
    }

    /// Inactivity timeout mid-transition. The session is released; the
    /// connection requires an explicit start or stop from here.
    pub fn on_timeout(&mut self) {
        self.state = ConnState::TimedOut;
        self.ip = None;
        self.manage.release();
    }

    /// Process exit confirmed (expected or not): release everything and
    /// settle in `disconnected`.
    pub fn finalize_exit(&mut self) {
        self.manage.release();
        self.state = ConnState::Disconnected;
        self.ip = None;
        self.connected_since = None;
        self.failed_psw_attempts = 0;
        self.pid = None;
        self.stop_requested = false;
        self.grace_deadline = None;
        self.proxy_type = None;
    }

    /// Point-in-time view for external collaborators.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            name: self.name.clone(),
            state: self.state.as_str(),
            ip: self.ip.clone(),
            connected_since: self.connected_since.map(|t| {
                t.duration_since(UNIX_EPOCH)
                    .map_or(0, |d| d.as_secs())
            }),
            failed_psw_attempts: self.failed_psw_attempts,
            pid: self.pid,
            peer_version: self.peer_version.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only per-connection state exposed to the presentation layer.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub name: String,
    pub state: &'static str,
    pub ip: Option<String>,
    /// Unix seconds, present only while an episode is live.
    pub connected_since: Option<u64>,
    pub failed_psw_attempts: u32,
    pub pid: Option<u32>,
    pub peer_version: Option<String>,
    pub last_error: Option<String>,
}

//! Central event loop driving every connection's state machine.
//!
//! All mutation of the registry happens here, on one task. Channel reader
//! tasks, process exit watchers and helper bridges only post [`Event`]s;
//! callers interact through the cloneable [`Supervisor`] handle and observe
//! state via the published [`RegistrySnapshot`] watch channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, LaunchMode};
use crate::connections::{ConnId, ConnState, Connection, Registry, RegistrySnapshot, ServiceState};
use crate::error::{Error, Result};
use crate::launcher;
use crate::manage::channel::{self, ChannelId, ChannelWriter};
use crate::manage::parser::{self, MgmtLine, Notice, Reply, StateKind};
use crate::manage::ManageCommand;
use crate::service::{self, ServiceBridge, ServiceMsg};

const EVENT_QUEUE_DEPTH: usize = 256;

/// A request from the outside (CLI, signal handler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start(ConnId),
    Stop(ConnId),
    /// Host is going to sleep: park every connected tunnel.
    SuspendAll,
    /// Host woke up: reconnect every suspended tunnel.
    ResumeAll,
}

/// Everything the dispatcher reacts to.
#[derive(Debug)]
pub enum Event {
    Command(Command),
    ChannelConnected {
        channel: ChannelId,
        writer: ChannelWriter,
        peer: SocketAddr,
    },
    ChannelLine {
        channel: ChannelId,
        line: String,
    },
    /// Recoverable per-line failure (oversized line dropped).
    ChannelError {
        channel: ChannelId,
        error: Error,
    },
    ChannelClosed {
        channel: ChannelId,
    },
    /// The process never connected back within the open timeout.
    ChannelFailed {
        channel: ChannelId,
        error: Error,
    },
    ProcessExited {
        conn: ConnId,
        status: Option<i32>,
    },
    ServiceLine {
        conn: ConnId,
        line: String,
    },
    ServiceClosed {
        conn: ConnId,
    },
    /// Begin graceful teardown of every active connection, then exit.
    Shutdown,
}

/// Cloneable handle for sending commands and reading published state.
#[derive(Debug, Clone)]
pub struct Supervisor {
    events: mpsc::Sender<Event>,
    status: watch::Receiver<RegistrySnapshot>,
}

impl Supervisor {
    pub async fn start(&self, conn: ConnId) {
        self.send(Event::Command(Command::Start(conn))).await;
    }

    pub async fn stop(&self, conn: ConnId) {
        self.send(Event::Command(Command::Stop(conn))).await;
    }

    pub async fn suspend_all(&self) {
        self.send(Event::Command(Command::SuspendAll)).await;
    }

    pub async fn resume_all(&self) {
        self.send(Event::Command(Command::ResumeAll)).await;
    }

    pub async fn shutdown(&self) {
        self.send(Event::Shutdown).await;
    }

    async fn send(&self, event: Event) {
        if self.events.send(event).await.is_err() {
            warn!("dispatcher is gone; command dropped");
        }
    }

    /// Latest published registry state.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistrySnapshot> {
        self.status.clone()
    }
}

struct Timeouts {
    open: Duration,
    inactivity: Duration,
    grace: Duration,
}

struct Dispatcher {
    config: Arc<Config>,
    registry: Registry,
    timeouts: Timeouts,
    rx: mpsc::Receiver<Event>,
    /// For handing to spawned workers so they can post back.
    tx: mpsc::Sender<Event>,
    status_tx: watch::Sender<RegistrySnapshot>,
    bridges: HashMap<ConnId, ServiceBridge>,
    shutting_down: bool,
    shutdown_deadline: Option<Instant>,
}

/// Spawn the dispatcher task.
pub fn spawn(config: Arc<Config>, registry: Registry) -> (Supervisor, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (status_tx, status_rx) = watch::channel(registry.snapshot());
    let timeouts = Timeouts {
        open: Duration::from_secs(config.manage.open_timeout_secs),
        inactivity: Duration::from_secs(config.manage.inactivity_timeout_secs),
        grace: Duration::from_secs(config.manage.stop_grace_secs),
    };
    let dispatcher = Dispatcher {
        config,
        registry,
        timeouts,
        rx,
        tx: tx.clone(),
        status_tx,
        bridges: HashMap::new(),
        shutting_down: false,
        shutdown_deadline: None,
    };
    let handle = tokio::spawn(dispatcher.run());
    (
        Supervisor {
            events: tx,
            status: status_rx,
        },
        handle,
    )
}

impl Dispatcher {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => self.on_tick().await,
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
            self.publish();
            if self.shutting_down && self.registry.active_count() == 0 {
                info!("all connections settled; dispatcher exiting");
                break;
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.registry.snapshot());
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Command(cmd) => self.handle_command(cmd).await,
            Event::ChannelConnected {
                channel,
                writer,
                peer,
            } => self.on_channel_connected(channel, writer, peer).await,
            Event::ChannelLine { channel, line } => self.on_channel_line(channel, &line).await,
            Event::ChannelError { channel, error } => {
                warn!(%channel, %error, "management line dropped");
                // Non-fatal: the channel stays usable, but the condition is
                // still shown to the presentation layer.
                if let Some(conn) = self.registry.lookup_by_channel(channel) {
                    conn.last_error = Some(error.to_string());
                }
            }
            Event::ChannelClosed { channel } => self.on_channel_closed(channel),
            Event::ChannelFailed { channel, error } => self.on_channel_failed(channel, error),
            Event::ProcessExited { conn, status } => self.on_process_exited(conn, status),
            Event::ServiceLine { conn, line } => self.on_service_line(conn, &line),
            Event::ServiceClosed { conn } => self.on_service_closed(conn),
            Event::Shutdown => self.on_shutdown().await,
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start(id) => {
                if let Err(e) = self.start_connection(id).await {
                    warn!(conn = %id, "start failed: {e}");
                    let channel = self.registry.get(id).and_then(|c| c.manage.channel_id);
                    if let Some(ch) = channel {
                        self.registry.unbind_channel(ch);
                    }
                    if let Some(conn) = self.registry.get_mut(id) {
                        conn.finalize_exit();
                        conn.last_error = Some(e.to_string());
                    }
                }
            }
            Command::Stop(id) => self.stop_connection(id).await,
            Command::SuspendAll => {
                for id in self.conn_ids() {
                    self.suspend_connection(id).await;
                }
            }
            Command::ResumeAll => {
                for id in self.conn_ids() {
                    self.resume_connection(id).await;
                }
            }
        }
    }

    fn conn_ids(&self) -> Vec<ConnId> {
        self.registry.iter().map(|c| c.id).collect()
    }

    /// Bind a listener, spawn the process (directly or via the helper) and
    /// move the connection into `connecting`.
    async fn start_connection(&mut self, id: ConnId) -> Result<()> {
        let deadline = Instant::now() + self.timeouts.inactivity;
        {
            let conn = self
                .registry
                .get_mut(id)
                .ok_or_else(|| Error::UnknownConnection(format!("{id}")))?;
            if !conn.begin_connecting(deadline) {
                debug!(conn = %id, state = %conn.state, "start ignored; session in progress");
                return Ok(());
            }
        }

        let pending = channel::listen().await?;
        let mgmt_addr = pending.local_addr;
        let channel_id = pending.id;
        self.registry.bind_channel(channel_id, id);
        pending.spawn_accept(
            self.timeouts.open,
            self.config.manage.max_line_bytes,
            self.tx.clone(),
        );

        let (launch, config_file, log_path) = {
            let conn = self
                .registry
                .get_mut(id)
                .ok_or_else(|| Error::UnknownConnection(format!("{id}")))?;
            conn.manage.channel_id = Some(channel_id);
            (conn.launch, conn.config_file.clone(), conn.log_path.clone())
        };

        match launch {
            LaunchMode::Direct => {
                let proxy = self.config.proxy.resolve();
                let process = launcher::launch(
                    &self.config.launcher,
                    id,
                    &config_file,
                    &log_path,
                    mgmt_addr,
                    proxy.as_ref(),
                    self.tx.clone(),
                )?;
                if let Some(conn) = self.registry.get_mut(id) {
                    conn.pid = Some(process.pid);
                    conn.proxy_type = proxy.map(|p| p.kind);
                }
            }
            LaunchMode::Service => {
                let socket = self
                    .config
                    .service
                    .as_ref()
                    .map(|s| PathBuf::from(&s.socket))
                    .ok_or_else(|| {
                        Error::ServiceUnavailable("no helper service configured".to_string())
                    })?;
                self.registry.service_state = ServiceState::Connecting;
                let mut bridge =
                    match ServiceBridge::connect(&socket, id, self.tx.clone()).await {
                        Ok(bridge) => bridge,
                        Err(e) => {
                            self.registry.service_state = ServiceState::Unreachable;
                            return Err(e);
                        }
                    };
                bridge.send_start(&config_file, mgmt_addr, &log_path).await?;
                self.bridges.insert(id, bridge);
                self.registry.service_state = ServiceState::Connected;
            }
        }
        info!(conn = %id, %mgmt_addr, "connection starting");
        Ok(())
    }

    async fn stop_connection(&mut self, id: ConnId) {
        let grace = Instant::now() + self.timeouts.grace;
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if !conn.begin_stop(grace) {
            debug!(conn = %id, "stop ignored; already disconnected");
            return;
        }
        info!(conn = %id, "stopping");
        if conn.manage.connected {
            conn.manage.queue.enqueue(ManageCommand::plain("signal SIGTERM"));
            pump(conn).await;
        } else if let Some(pid) = conn.pid {
            if conn.launch == LaunchMode::Service {
                if let Some(bridge) = self.bridges.get_mut(&id) {
                    if let Err(e) = bridge.send_stop().await {
                        warn!(conn = %id, "helper stop failed: {e}");
                        launcher::terminate(pid);
                    }
                }
            } else {
                launcher::terminate(pid);
            }
        } else {
            // Nothing to signal; settle immediately.
            conn.finalize_exit();
        }
    }

    /// Park a connected tunnel: arm the hold flag, then soft-restart so the
    /// process drops the tunnel and waits in hold.
    async fn suspend_connection(&mut self, id: ConnId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if !conn.begin_suspend() {
            return;
        }
        info!(conn = %id, "suspending");
        conn.manage.queue.enqueue(ManageCommand::plain("hold on"));
        conn.manage.queue.enqueue(ManageCommand::plain("signal SIGUSR1"));
        pump(conn).await;
    }

    async fn resume_connection(&mut self, id: ConnId) {
        let deadline = Instant::now() + self.timeouts.inactivity;
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if !conn.begin_resume(deadline) {
            return;
        }
        info!(conn = %id, "resuming");
        conn.manage.queue.enqueue(ManageCommand::plain("hold off"));
        conn.manage.queue.enqueue(ManageCommand::plain("hold release"));
        pump(conn).await;
    }

    async fn on_channel_connected(
        &mut self,
        channel: ChannelId,
        writer: ChannelWriter,
        peer: SocketAddr,
    ) {
        let deadline = Instant::now() + self.timeouts.inactivity;
        let Some(conn) = self.registry.lookup_by_channel(channel) else {
            debug!(%channel, "stale channel connect dropped");
            return;
        };
        info!(conn = %conn.id, %peer, "management channel up");
        conn.on_channel_up(peer);
        conn.manage.writer = Some(writer);
        conn.touch(deadline);
        conn.manage.queue.enqueue(ManageCommand::plain("state on"));
        conn.manage.queue.enqueue(ManageCommand::plain("log on"));
        conn.manage.queue.enqueue(ManageCommand::plain("version"));
        pump(conn).await;
    }

    async fn on_channel_line(&mut self, channel: ChannelId, line: &str) {
        let deadline = Instant::now() + self.timeouts.inactivity;
        let max_retries = self.config.manage.max_auth_retries;
        let grace = Instant::now() + self.timeouts.grace;
        let Some(conn) = self.registry.lookup_by_channel(channel) else {
            debug!(%channel, "stale channel line dropped");
            return;
        };
        conn.touch(deadline);

        match parser::parse_line(line) {
            MgmtLine::Notice(notice) => {
                handle_notice(conn, notice, max_retries, grace, deadline).await;
            }
            MgmtLine::Reply(reply) => {
                let in_flight = conn
                    .manage
                    .queue
                    .in_flight_text()
                    .map(str::to_string)
                    .unwrap_or_default();
                match reply {
                    Reply::Success(msg) => {
                        debug!(conn = %conn.id, cmd = %in_flight, %msg, "command ok");
                    }
                    Reply::Error(msg) => {
                        warn!(conn = %conn.id, cmd = %in_flight, %msg, "command rejected");
                    }
                    Reply::End => {}
                }
                conn.manage.queue.complete();
                pump(conn).await;
            }
            MgmtLine::Version(version) => {
                debug!(conn = %conn.id, %version, "peer version");
                conn.peer_version = Some(version);
            }
            MgmtLine::Other(text) => {
                debug!(conn = %conn.id, %text, "unrecognized management line");
            }
        }
    }

    /// Zero-length read on the channel: the peer is gone. With no stop
    /// requested this is unexpected termination, so the connection settles in
    /// `disconnected` right away instead of lingering behind a stale address.
    fn on_channel_closed(&mut self, channel: ChannelId) {
        let Some(conn) = self.registry.lookup_by_channel(channel) else {
            return;
        };
        let id = conn.id;
        conn.manage.writer = None;
        conn.manage.connected = false;
        if conn.state.is_active() && !conn.stop_requested {
            warn!(conn = %id, "management channel closed unexpectedly");
            if let Some(pid) = conn.pid {
                launcher::kill(pid);
            }
            conn.finalize_exit();
            conn.last_error = Some("management channel closed unexpectedly".to_string());
        } else {
            // A stop is in progress (or the session is already settled); the
            // exit watcher and the grace timer finish the teardown.
            debug!(conn = %id, "management channel closed");
        }
        self.registry.unbind_channel(channel);
    }

    fn on_channel_failed(&mut self, channel: ChannelId, error: Error) {
        let Some(conn) = self.registry.lookup_by_channel(channel) else {
            return;
        };
        let id = conn.id;
        warn!(conn = %id, %error, "management channel never opened");
        if let Some(pid) = conn.pid {
            launcher::kill(pid);
        }
        conn.on_timeout();
        conn.last_error = Some(error.to_string());
        self.registry.unbind_channel(channel);
    }

    fn on_process_exited(&mut self, id: ConnId, status: Option<i32>) {
        self.bridges.remove(&id);
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        let channel = conn.manage.channel_id;
        let expected = conn.stop_requested;
        conn.finalize_exit();
        if expected {
            info!(conn = %id, ?status, "tunnel process exited");
        } else {
            warn!(conn = %id, ?status, "tunnel process exited unexpectedly");
            conn.last_error = Some(match status {
                Some(code) => format!("process exited unexpectedly (status {code})"),
                None => "process terminated by signal".to_string(),
            });
        }
        if let Some(ch) = channel {
            self.registry.unbind_channel(ch);
        }
    }

    fn on_service_line(&mut self, id: ConnId, line: &str) {
        match service::parse_service_line(line) {
            ServiceMsg::Pid(pid) => {
                if let Some(conn) = self.registry.get_mut(id) {
                    debug!(conn = %id, pid, "helper spawned tunnel process");
                    conn.pid = Some(pid);
                }
            }
            ServiceMsg::Exit(code) => self.on_process_exited(id, Some(code)),
            ServiceMsg::Error(msg) => {
                warn!(conn = %id, %msg, "helper reported failure");
                let started = self.registry.get(id).map_or(false, |c| c.pid.is_some());
                if !started {
                    // Never launched; settle without waiting for an exit.
                    let channel = self.registry.get(id).and_then(|c| c.manage.channel_id);
                    if let Some(ch) = channel {
                        self.registry.unbind_channel(ch);
                    }
                    if let Some(conn) = self.registry.get_mut(id) {
                        conn.finalize_exit();
                        conn.last_error = Some(msg);
                    }
                } else if let Some(conn) = self.registry.get_mut(id) {
                    conn.last_error = Some(msg);
                }
            }
            ServiceMsg::Log(text) => info!(conn = %id, "helper: {text}"),
            ServiceMsg::Unknown(text) => debug!(conn = %id, %text, "unknown helper line"),
        }
    }

    fn on_service_closed(&mut self, id: ConnId) {
        self.bridges.remove(&id);
        if self.bridges.is_empty() && self.config.service.is_some() {
            self.registry.service_state = ServiceState::Disconnected;
        }
        if let Some(conn) = self.registry.get(id) {
            if conn.state.is_active() && !conn.stop_requested {
                warn!(conn = %id, "helper session closed while connection active");
            }
        }
    }

    async fn on_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!("shutdown requested; stopping all connections");
        self.shutting_down = true;
        self.shutdown_deadline = Some(Instant::now() + self.timeouts.grace + Duration::from_secs(2));
        for id in self.conn_ids() {
            self.stop_connection(id).await;
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let mut stale = Vec::new();
        for conn in self.registry.iter_mut() {
            // Inactivity while mid-transition
            if let Some(deadline) = conn.manage.deadline {
                if now >= deadline && conn.state.is_active() {
                    warn!(conn = %conn.id, state = %conn.state, "management session timed out");
                    if let Some(pid) = conn.pid {
                        launcher::kill(pid);
                    }
                    if let Some(ch) = conn.manage.channel_id {
                        stale.push(ch);
                    }
                    conn.on_timeout();
                    conn.last_error = Some(Error::Timeout.to_string());
                    continue;
                }
            }
            // Stop grace expired: escalate to SIGKILL
            if conn.state == ConnState::Disconnecting {
                if let Some(grace) = conn.grace_deadline {
                    if now >= grace {
                        warn!(conn = %conn.id, "stop grace expired; killing process");
                        if let Some(pid) = conn.pid {
                            launcher::kill(pid);
                        }
                        conn.grace_deadline = None;
                    }
                }
            }
        }
        for ch in stale {
            self.registry.unbind_channel(ch);
        }
        if self.shutting_down {
            if let Some(deadline) = self.shutdown_deadline {
                if now >= deadline {
                    warn!("shutdown deadline passed; abandoning remaining connections");
                    for conn in self.registry.iter_mut() {
                        if conn.state.is_active() {
                            if let Some(pid) = conn.pid {
                                launcher::kill(pid);
                            }
                            conn.finalize_exit();
                        }
                    }
                }
            }
        }
    }
}

/// React to an async notice from the managed process.
async fn handle_notice(
    conn: &mut Connection,
    notice: Notice,
    max_retries: u32,
    grace: Instant,
    transition_deadline: Instant,
) {
    match notice {
        Notice::State(state) => match state.kind {
            StateKind::Connected => {
                if let Some(ip) = state.ip {
                    info!(conn = %conn.id, %ip, "tunnel established");
                    conn.on_tunnel_up(ip, SystemTime::now());
                }
            }
            StateKind::Reconnecting => {
                info!(conn = %conn.id, reason = %state.detail, "tunnel restarting");
                conn.on_reconnecting(transition_deadline);
            }
            StateKind::Exiting => {
                debug!(conn = %conn.id, "process announced exit");
            }
            StateKind::Other => {
                debug!(conn = %conn.id, phase = %state.name, "state phase");
            }
        },
        Notice::PasswordNeed { id } => {
            if !conn.may_submit_password(max_retries) {
                warn!(conn = %conn.id, "credential prompt after retry limit");
                return;
            }
            let Some(username) = conn.username.clone() else {
                warn!(conn = %conn.id, "no credentials configured; disconnecting");
                conn.last_error = Some("credentials required but not configured".to_string());
                conn.manage.queue.enqueue(ManageCommand::plain("signal SIGTERM"));
                conn.begin_stop(grace);
                pump(conn).await;
                return;
            };
            // Compose the password command straight from the cached secret;
            // the only other copy is the command text, wiped after sending.
            let pass_cmd = match conn.manage.password.as_ref() {
                Some(password) => {
                    ManageCommand::secret("password", &[id.as_str(), password.expose()])
                }
                None => {
                    warn!(conn = %conn.id, "no password cached; disconnecting");
                    conn.last_error =
                        Some("credentials required but not configured".to_string());
                    conn.manage.queue.enqueue(ManageCommand::plain("signal SIGTERM"));
                    conn.begin_stop(grace);
                    pump(conn).await;
                    return;
                }
            };
            debug!(conn = %conn.id, need = %id, "submitting credentials");
            conn.manage
                .queue
                .enqueue(ManageCommand::with_args("username", &[id.as_str(), username.as_str()]));
            conn.manage.queue.enqueue(pass_cmd);
            pump(conn).await;
        }
        Notice::AuthFailed { id, challenge } => {
            let outcome = conn.on_auth_failed(max_retries, challenge);
            warn!(
                conn = %conn.id,
                need = %id,
                attempts = conn.failed_psw_attempts,
                "authentication failed"
            );
            if outcome == crate::connections::AuthOutcome::LimitReached {
                conn.last_error =
                    Some(Error::AuthRejected(conn.failed_psw_attempts).to_string());
                conn.manage.queue.enqueue(ManageCommand::plain("signal SIGTERM"));
                conn.begin_stop(grace);
                pump(conn).await;
            }
        }
        Notice::Hold => match conn.state {
            ConnState::Suspending => {
                info!(conn = %conn.id, "suspended");
                conn.on_suspend_ack();
            }
            ConnState::Suspended => {}
            _ => {
                debug!(conn = %conn.id, "releasing startup hold");
                conn.manage.queue.enqueue(ManageCommand::plain("hold release"));
                pump(conn).await;
            }
        },
        Notice::Info(text) => debug!(conn = %conn.id, %text, "management greeting"),
        Notice::Log(text) => debug!(conn = %conn.id, "process log: {text}"),
        Notice::Fatal(text) => {
            warn!(conn = %conn.id, %text, "fatal error from process");
            conn.last_error = Some(text);
        }
    }
}

/// Push the queue head out if the channel is writable and nothing is in
/// flight. Secret text is wiped as soon as the bytes are handed to the socket.
async fn pump(conn: &mut Connection) {
    let manage = &mut conn.manage;
    let Some(writer) = manage.writer.as_mut() else {
        return;
    };
    if let Some(cmd) = manage.queue.promote() {
        let result = writer.send_line(cmd.text()).await;
        cmd.wipe_if_secret();
        if let Err(e) = result {
            // Reader side will post ChannelClosed; nothing more to do here.
            debug!(conn = %conn.id, "channel write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    fn test_config(connections: Vec<ConnectionConfig>) -> Arc<Config> {
        let mut config = Config::for_tests();
        config.connections = connections;
        Arc::new(config)
    }

    fn conn_cfg(name: &str) -> ConnectionConfig {
        ConnectionConfig {
            name: name.to_string(),
            config_file: "/dev/null".to_string(),
            log_path: Some("/dev/null".to_string()),
            auto_connect: false,
            launch: LaunchMode::Direct,
            username: None,
            password: None,
        }
    }

    async fn wait_snapshot(
        status: &mut watch::Receiver<RegistrySnapshot>,
        pred: impl Fn(&RegistrySnapshot) -> bool,
    ) {
        loop {
            if pred(&status.borrow_and_update()) {
                return;
            }
            status.changed().await.unwrap();
        }
    }

    /// A fake helper socket plus the config pointing at it.
    fn helper_setup(test: &str, conn: ConnectionConfig) -> (tokio::net::UnixListener, Arc<Config>) {
        let dir = std::env::temp_dir().join(format!("tunctl-{}-{test}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let socket_path = dir.join("helper.sock");
        let _ = std::fs::remove_file(&socket_path);
        let helper = tokio::net::UnixListener::bind(&socket_path).unwrap();

        let mut config = Config::for_tests();
        config.service = Some(crate::config::ServiceConfig {
            socket: socket_path.to_string_lossy().into_owned(),
        });
        config.connections = vec![ConnectionConfig {
            launch: LaunchMode::Service,
            ..conn
        }];
        (helper, Arc::new(config))
    }

    #[tokio::test]
    async fn test_snapshot_published_at_startup() {
        let config = test_config(vec![conn_cfg("office"), conn_cfg("home")]);
        let registry = Registry::from_config(&config).unwrap();
        let (supervisor, handle) = spawn(config, registry);

        let snap = supervisor.snapshot();
        assert_eq!(snap.connections.len(), 2);
        assert_eq!(snap.connections[0].state, "disconnected");

        supervisor.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_on_disconnected_is_noop() {
        let config = test_config(vec![conn_cfg("office")]);
        let registry = Registry::from_config(&config).unwrap();
        let (supervisor, handle) = spawn(config, registry);

        supervisor.stop(ConnId(0)).await;
        let mut status = supervisor.subscribe();
        status.changed().await.unwrap();
        assert_eq!(status.borrow().connections[0].state, "disconnected");

        supervisor.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_with_idle_registry_exits() {
        let config = test_config(vec![conn_cfg("office")]);
        let registry = Registry::from_config(&config).unwrap();
        let (supervisor, handle) = spawn(config, registry);
        supervisor.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_password_flow_reaches_connected_then_exit_settles() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpStream;

        let (helper, config) = helper_setup(
            "flow",
            ConnectionConfig {
                username: Some("alice".to_string()),
                password: Some("hunter2".to_string()),
                ..conn_cfg("office")
            },
        );
        let registry = Registry::from_config(&config).unwrap();
        let (supervisor, handle) = spawn(config, registry);

        supervisor.start(ConnId(0)).await;

        // Fake helper: read the start frame, report the spawned pid.
        let (stream, _) = helper.accept().await.unwrap();
        let (helper_read, mut helper_write) = stream.into_split();
        let mut helper_lines = BufReader::new(helper_read).lines();
        let start = helper_lines.next_line().await.unwrap().unwrap();
        let fields: Vec<&str> = start.split('\t').collect();
        assert_eq!(fields[0], "start");
        let mgmt_addr = fields[2].to_string();
        helper_write.write_all(b"pid 4242\n").await.unwrap();

        // Fake tunnel process: dial the management endpoint, run the script.
        let peer = TcpStream::connect(&mgmt_addr).await.unwrap();
        let (peer_read, mut peer_write) = peer.into_split();
        let mut peer_lines = BufReader::new(peer_read).lines();

        for expected in ["state on", "log on", "version"] {
            let cmd = peer_lines.next_line().await.unwrap().unwrap();
            assert_eq!(cmd, expected);
            if expected == "version" {
                peer_write
                    .write_all(b"OpenVPN Version: OpenVPN 2.6.8\nEND\n")
                    .await
                    .unwrap();
            } else {
                peer_write.write_all(b"SUCCESS: ok\n").await.unwrap();
            }
        }

        peer_write
            .write_all(b">PASSWORD:Need 'Auth' username/password\n")
            .await
            .unwrap();
        let user = peer_lines.next_line().await.unwrap().unwrap();
        assert_eq!(user, "username \"Auth\" \"alice\"");
        peer_write.write_all(b"SUCCESS: ok\n").await.unwrap();
        let pass = peer_lines.next_line().await.unwrap().unwrap();
        assert_eq!(pass, "password \"Auth\" \"hunter2\"");
        peer_write.write_all(b"SUCCESS: ok\n").await.unwrap();

        peer_write
            .write_all(b">STATE:1700000000,CONNECTED,SUCCESS,10.8.0.5,\n")
            .await
            .unwrap();

        let mut status = supervisor.subscribe();
        wait_snapshot(&mut status, |snap| {
            snap.connections[0].state == "connected" && snap.connections[0].pid == Some(4242)
        })
        .await;
        {
            let snap = status.borrow();
            assert_eq!(snap.connections[0].ip.as_deref(), Some("10.8.0.5"));
            assert!(snap.connections[0].connected_since.is_some());
            assert_eq!(
                snap.connections[0].peer_version.as_deref(),
                Some("OpenVPN 2.6.8")
            );
            assert_eq!(snap.service_state, ServiceState::Connected);
        }

        // Helper reports the process gone with no stop requested.
        helper_write.write_all(b"exit 0\n").await.unwrap();
        wait_snapshot(&mut status, |snap| {
            snap.connections[0].state == "disconnected"
        })
        .await;
        {
            let snap = status.borrow();
            assert!(snap.connections[0].ip.is_none());
            assert!(snap.connections[0].connected_since.is_none());
            assert!(snap.connections[0].last_error.is_some());
        }

        supervisor.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_line_survives_channel_close_does_not() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpStream;

        let (helper, config) = helper_setup("close", conn_cfg("office"));
        let registry = Registry::from_config(&config).unwrap();
        let max_line = config.manage.max_line_bytes;
        let (supervisor, handle) = spawn(config, registry);

        supervisor.start(ConnId(0)).await;

        // Fake helper that never reports a pid.
        let (stream, _) = helper.accept().await.unwrap();
        let (helper_read, _helper_write) = stream.into_split();
        let mut helper_lines = BufReader::new(helper_read).lines();
        let start = helper_lines.next_line().await.unwrap().unwrap();
        let mgmt_addr = start.split('\t').nth(2).unwrap().to_string();

        let peer = TcpStream::connect(&mgmt_addr).await.unwrap();
        let (peer_read, mut peer_write) = peer.into_split();
        let mut peer_lines = BufReader::new(peer_read).lines();
        for _ in 0..3 {
            peer_lines.next_line().await.unwrap().unwrap();
            peer_write.write_all(b"SUCCESS: ok\n").await.unwrap();
        }
        peer_write
            .write_all(b">STATE:1700000000,CONNECTED,SUCCESS,10.8.0.5,\n")
            .await
            .unwrap();

        let mut status = supervisor.subscribe();
        wait_snapshot(&mut status, |snap| snap.connections[0].state == "connected").await;

        // A line over the framing limit is dropped and surfaced, but the
        // channel keeps working.
        let mut oversized = vec![b'x'; max_line + 64];
        oversized.push(b'\n');
        peer_write.write_all(&oversized).await.unwrap();
        let dropped = Error::OversizedMessage { limit: max_line }.to_string();
        wait_snapshot(&mut status, |snap| {
            snap.connections[0].last_error.as_deref() == Some(dropped.as_str())
        })
        .await;
        assert_eq!(status.borrow().connections[0].state, "connected");

        // Peer closes with no stop requested: straight to disconnected.
        drop(peer_write);
        drop(peer_lines);
        wait_snapshot(&mut status, |snap| {
            snap.connections[0].state == "disconnected"
        })
        .await;
        {
            let snap = status.borrow();
            assert!(snap.connections[0].ip.is_none());
            assert_eq!(
                snap.connections[0].last_error.as_deref(),
                Some("management channel closed unexpectedly")
            );
        }

        supervisor.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_helper_records_service_state() {
        let mut config = Config::for_tests();
        config.service = Some(crate::config::ServiceConfig {
            socket: "/nonexistent/tunctl-helper.sock".to_string(),
        });
        config.connections = vec![ConnectionConfig {
            launch: LaunchMode::Service,
            ..conn_cfg("office")
        }];
        let config = Arc::new(config);
        let registry = Registry::from_config(&config).unwrap();
        let (supervisor, handle) = spawn(config, registry);

        supervisor.start(ConnId(0)).await;
        let mut status = supervisor.subscribe();
        wait_snapshot(&mut status, |snap| {
            snap.service_state == ServiceState::Unreachable
                && snap.connections[0].last_error.is_some()
        })
        .await;
        assert_eq!(status.borrow().connections[0].state, "disconnected");

        supervisor.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_with_missing_binary_records_error() {
        let mut config = Config::for_tests();
        config.launcher.binary = "/nonexistent/openvpn".to_string();
        config.connections = vec![conn_cfg("office")];
        let config = Arc::new(config);
        let registry = Registry::from_config(&config).unwrap();
        let (supervisor, handle) = spawn(config, registry);

        supervisor.start(ConnId(0)).await;
        let mut status = supervisor.subscribe();
        loop {
            status.changed().await.unwrap();
            let snap = status.borrow().clone();
            if snap.connections[0].last_error.is_some() {
                assert_eq!(snap.connections[0].state, "disconnected");
                break;
            }
        }

        supervisor.shutdown().await;
        handle.await.unwrap();
    }
}

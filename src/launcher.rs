//! Direct launch of the tunnel process.
//!
//! Builds the command line (config, management endpoint, log file, proxy
//! overrides), spawns the process and watches it from a background task that
//! posts [`Event::ProcessExited`] when it goes away. Signals are delivered by
//! pid; the dispatcher escalates SIGTERM to SIGKILL itself when the stop
//! grace period runs out.

use std::net::SocketAddr;
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{LauncherConfig, ProxyKind, ResolvedProxy};
use crate::connections::ConnId;
use crate::dispatcher::Event;
use crate::error::{Error, Result};

/// A spawned tunnel process being watched for exit.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub pid: u32,
}

/// Spawn the tunnel process for one connection.
///
/// Stdio is discarded; the process writes its own log at `log_path`. The exit
/// watcher task owns the `Child` and posts exactly one `ProcessExited` event.
pub fn launch(
    launcher: &LauncherConfig,
    conn: ConnId,
    config_file: &str,
    log_path: &str,
    management: SocketAddr,
    proxy: Option<&ResolvedProxy>,
    events: mpsc::Sender<Event>,
) -> Result<LaunchedProcess> {
    let mut cmd = Command::new(&launcher.binary);
    cmd.arg("--config")
        .arg(config_file)
        .arg("--management")
        .arg(management.ip().to_string())
        .arg(management.port().to_string())
        .arg("--management-query-passwords")
        .arg("--management-hold")
        .arg("--log")
        .arg(log_path);
    if let Some(p) = proxy {
        match p.kind {
            ProxyKind::Http => cmd.arg("--http-proxy"),
            ProxyKind::Socks => cmd.arg("--socks-proxy"),
        };
        cmd.arg(&p.address).arg(p.port.to_string());
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Config(format!("failed to spawn {}: {e}", launcher.binary)))?;
    let pid = child.id().unwrap_or(0);
    info!(%conn, pid, config_file, "tunnel process started");

    tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(s) => {
                debug!(%conn, ?s, "tunnel process exited");
                s.code()
            }
            Err(e) => {
                warn!(%conn, "wait on tunnel process failed: {e}");
                None
            }
        };
        let _ = events.send(Event::ProcessExited { conn, status }).await;
    });

    Ok(LaunchedProcess { pid })
}

/// Ask the process to shut down. The management `signal SIGTERM` command is
/// preferred; this is the fallback when the channel never came up.
pub fn terminate(pid: u32) {
    signal(pid, libc::SIGTERM);
}

/// Hard-kill after the stop grace period.
pub fn kill(pid: u32) {
    signal(pid, libc::SIGKILL);
}

fn signal(pid: u32, sig: i32) {
    #[allow(clippy::cast_possible_wrap)]
    let pid = pid as i32;
    if pid <= 0 {
        return;
    }
    let ret = unsafe { libc::kill(pid, sig) };
    if ret != 0 {
        debug!(pid, sig, "kill failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, ProxySource};

    #[test]
    fn test_signal_on_dead_pid_is_silent() {
        // pid 0 is rejected before reaching the syscall
        signal(0, libc::SIGTERM);
    }

    #[tokio::test]
    async fn test_launch_posts_exit_event() {
        let launcher = LauncherConfig {
            binary: "/bin/true".to_string(),
            log_dir: "/tmp".to_string(),
        };
        let (tx, mut rx) = mpsc::channel(8);
        let proc = launch(
            &launcher,
            ConnId(0),
            "/dev/null",
            "/dev/null",
            "127.0.0.1:9000".parse().unwrap(),
            None,
            tx,
        )
        .unwrap();
        assert!(proc.pid > 0);

        match rx.recv().await {
            Some(Event::ProcessExited { conn, status }) => {
                assert_eq!(conn, ConnId(0));
                assert_eq!(status, Some(0));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_launch_missing_binary_fails() {
        let launcher = LauncherConfig {
            binary: "/nonexistent/openvpn".to_string(),
            log_dir: "/tmp".to_string(),
        };
        let (tx, _rx) = mpsc::channel(8);
        let err = launch(
            &launcher,
            ConnId(0),
            "/dev/null",
            "/dev/null",
            "127.0.0.1:9000".parse().unwrap(),
            None,
            tx,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_proxy_resolution_feeds_launch_args() {
        let cfg = ProxyConfig {
            source: ProxySource::Manual,
            kind: ProxyKind::Http,
            http_address: "proxy.example.net".to_string(),
            http_port: 8080,
            socks_address: String::new(),
            socks_port: 0,
        };
        let proxy = cfg.resolve().unwrap();
        assert_eq!(proxy.address, "proxy.example.net");
        assert_eq!(proxy.port, 8080);
    }
}

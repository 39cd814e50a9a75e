//! Bridge to the privileged helper service.
//!
//! When a connection is configured with `launch = "service"`, the tunnel
//! process is started by a separate privileged helper instead of directly.
//! The bridge speaks a small line protocol over the helper's Unix socket:
//! one tab-separated `start` request out, then `pid`/`log`/`error`/`exit`
//! status lines back until the helper closes its end.
//!
//! One bridge exists per launched connection. The reader task keeps a single
//! read pending and posts every status line to the dispatcher; the write side
//! stays with the dispatcher for the lone `start` request.

use std::net::SocketAddr;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connections::ConnId;
use crate::dispatcher::Event;
use crate::error::{Error, Result};

/// A status line from the helper, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceMsg {
    /// The helper spawned the process.
    Pid(u32),
    /// The process exited with this code. The helper closes after sending it.
    Exit(i32),
    /// The helper could not start or lost the process.
    Error(String),
    /// Passthrough output from the helper, forwarded to the log.
    Log(String),
    Unknown(String),
}

/// Decode one helper status line. Unknown verbs are preserved for logging
/// rather than dropped.
pub fn parse_service_line(line: &str) -> ServiceMsg {
    let (verb, rest) = match line.split_once(' ') {
        Some((v, r)) => (v, r),
        None => (line, ""),
    };
    match verb {
        "pid" => match rest.trim().parse() {
            Ok(pid) => ServiceMsg::Pid(pid),
            Err(_) => ServiceMsg::Unknown(line.to_string()),
        },
        "exit" => match rest.trim().parse() {
            Ok(code) => ServiceMsg::Exit(code),
            Err(_) => ServiceMsg::Unknown(line.to_string()),
        },
        "error" => ServiceMsg::Error(rest.to_string()),
        "log" => ServiceMsg::Log(rest.to_string()),
        _ => ServiceMsg::Unknown(line.to_string()),
    }
}

/// Write half of one helper session.
pub struct ServiceBridge {
    conn: ConnId,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl std::fmt::Debug for ServiceBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBridge").field("conn", &self.conn).finish()
    }
}

impl ServiceBridge {
    /// Open a helper session for one connection. A refused or missing socket
    /// maps to [`Error::ServiceUnavailable`] so the caller can surface it
    /// without starting the state machine.
    pub async fn connect(
        socket: &Path,
        conn: ConnId,
        events: mpsc::Sender<Event>,
    ) -> Result<Self> {
        let stream = UnixStream::connect(socket)
            .await
            .map_err(|e| Error::ServiceUnavailable(format!("{}: {e}", socket.display())))?;
        let (read_half, writer) = stream.into_split();
        tokio::spawn(read_loop(conn, read_half, events));
        Ok(Self { conn, writer })
    }

    /// Ask the helper to start the tunnel process.
    pub async fn send_start(
        &mut self,
        config_file: &str,
        management: SocketAddr,
        log_path: &str,
    ) -> Result<()> {
        let frame = format!("start\t{config_file}\t{management}\t{log_path}\n");
        self.write_command(&frame).await
    }

    /// Ask the helper to terminate the process it spawned. Used when the
    /// management channel is not available for a graceful `signal SIGTERM`.
    pub async fn send_stop(&mut self) -> Result<()> {
        self.write_command("stop\n").await
    }

    async fn write_command(&mut self, frame: &str) -> Result<()> {
        self.writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| Error::BridgeWriteFailed(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::BridgeWriteFailed(e.to_string()))
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// One pending read at a time; every complete line becomes an event. EOF or
/// a read error posts `ServiceClosed` and ends the task.
async fn read_loop<R>(conn: ConnId, read_half: R, events: mpsc::Sender<Event>)
where
    R: AsyncRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(%conn, %line, "helper status");
                if events
                    .send(Event::ServiceLine { conn, line })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(%conn, "helper read failed: {e}");
                break;
            }
        }
    }
    let _ = events.send(Event::ServiceClosed { conn }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_lines() {
        assert_eq!(parse_service_line("pid 4188"), ServiceMsg::Pid(4188));
        assert_eq!(parse_service_line("exit 0"), ServiceMsg::Exit(0));
        assert_eq!(parse_service_line("exit 1"), ServiceMsg::Exit(1));
        assert_eq!(
            parse_service_line("error config file not found"),
            ServiceMsg::Error("config file not found".to_string())
        );
        assert_eq!(
            parse_service_line("log Initialization Sequence Completed"),
            ServiceMsg::Log("Initialization Sequence Completed".to_string())
        );
    }

    #[test]
    fn test_parse_malformed_lines() {
        assert_eq!(
            parse_service_line("pid abc"),
            ServiceMsg::Unknown("pid abc".to_string())
        );
        assert_eq!(
            parse_service_line("restart"),
            ServiceMsg::Unknown("restart".to_string())
        );
    }

    #[tokio::test]
    async fn test_connect_missing_socket_is_unavailable() {
        let (tx, _rx) = mpsc::channel(4);
        let err = ServiceBridge::connect(Path::new("/nonexistent/helper.sock"), ConnId(0), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_read_loop_posts_lines_and_close() {
        let (mut client, server) = tokio::io::duplex(256);
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(read_loop(ConnId(3), server, tx));

        use tokio::io::AsyncWriteExt;
        client.write_all(b"pid 314\nexit 0\n").await.unwrap();
        drop(client);

        match rx.recv().await {
            Some(Event::ServiceLine { conn, line }) => {
                assert_eq!(conn, ConnId(3));
                assert_eq!(parse_service_line(&line), ServiceMsg::Pid(314));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await {
            Some(Event::ServiceLine { line, .. }) => {
                assert_eq!(parse_service_line(&line), ServiceMsg::Exit(0));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            rx.recv().await,
            Some(Event::ServiceClosed { conn: ConnId(3) })
        ));
    }
}

//! Management-channel transport: listener, reader task, and writer handle.
//!
//! tunctl listens on a loopback port per connection and the managed process
//! connects back to it. The reader task owns the read half and a
//! [`LineAssembler`] that stages partial reads; every complete line is posted
//! to the dispatcher as an event. The write half lives on the connection's
//! management session so the dispatcher can send queued commands.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::dispatcher::Event;
use crate::error::Error;

/// Stable token identifying one management socket. The registry maps these
/// back to connections; a stale id simply fails the lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl ChannelId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Result of feeding one read's bytes into the assembler.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Assembled {
    /// Complete lines, terminators stripped (`\r\n` and `\n` both accepted).
    pub lines: Vec<String>,
    /// Number of lines dropped for exceeding the buffer limit.
    pub oversized: usize,
}

/// Stages partial reads until a full line is available.
///
/// The staged buffer never holds a line terminator: a terminator always
/// drains the buffer into a completed line before the next read. Lines longer
/// than `max_line` are discarded up to their terminator and counted.
#[derive(Debug)]
pub struct LineAssembler {
    buf: Vec<u8>,
    max_line: usize,
    discarding: bool,
}

impl LineAssembler {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Assembled {
        let mut out = Assembled::default();
        for &b in chunk {
            if b == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else {
                    if self.buf.last() == Some(&b'\r') {
                        self.buf.pop();
                    }
                    out.lines
                        .push(String::from_utf8_lossy(&self.buf).into_owned());
                }
                self.buf.clear();
                continue;
            }
            if self.discarding {
                continue;
            }
            self.buf.push(b);
            if self.buf.len() > self.max_line {
                self.buf.clear();
                self.discarding = true;
                out.oversized += 1;
            }
        }
        out
    }

    /// Bytes currently staged (always a strict line prefix).
    pub fn staged_len(&self) -> usize {
        self.buf.len()
    }
}

/// Write half of an open management channel, held by the dispatcher.
pub struct ChannelWriter {
    pub id: ChannelId,
    writer: OwnedWriteHalf,
}

impl ChannelWriter {
    /// Send one command line. The newline is written separately so no copy of
    /// a secret command's text is ever built.
    pub async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter").field("id", &self.id).finish()
    }
}

/// A bound listener waiting for the managed process to connect back.
pub struct PendingChannel {
    pub id: ChannelId,
    pub local_addr: SocketAddr,
    listener: TcpListener,
}

/// Bind a fresh loopback listener for one connection's channel.
pub async fn listen() -> std::io::Result<PendingChannel> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let local_addr = listener.local_addr()?;
    Ok(PendingChannel {
        id: ChannelId::next(),
        local_addr,
        listener,
    })
}

impl PendingChannel {
    /// Accept the managed process within `open_timeout`, then run the reader
    /// loop until the peer closes. All outcomes are posted as events; the
    /// task never touches connection state directly.
    pub fn spawn_accept(
        self,
        open_timeout: Duration,
        max_line: usize,
        events: mpsc::Sender<Event>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let id = self.id;
            let accepted = timeout(open_timeout, self.listener.accept()).await;
            let (stream, peer) = match accepted {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    let _ = events
                        .send(Event::ChannelFailed {
                            channel: id,
                            error: Error::ChannelUnavailable(e.to_string()),
                        })
                        .await;
                    return;
                }
                Err(_) => {
                    let _ = events
                        .send(Event::ChannelFailed {
                            channel: id,
                            error: Error::ChannelUnavailable(format!(
                                "no management connection within {}s",
                                open_timeout.as_secs()
                            )),
                        })
                        .await;
                    return;
                }
            };

            let _ = stream.set_nodelay(true);
            let (read_half, write_half) = stream.into_split();
            let writer = ChannelWriter {
                id,
                writer: write_half,
            };
            if events
                .send(Event::ChannelConnected {
                    channel: id,
                    writer,
                    peer,
                })
                .await
                .is_err()
            {
                return;
            }
            read_loop(id, read_half, max_line, events).await;
        })
    }
}

/// Read chunks into the assembler and post one event per complete line.
/// A zero-length read or read error closes the channel.
async fn read_loop(
    id: ChannelId,
    mut read_half: OwnedReadHalf,
    max_line: usize,
    events: mpsc::Sender<Event>,
) {
    use tokio::io::AsyncReadExt;

    let mut assembler = LineAssembler::new(max_line);
    let mut tmp = [0u8; 4096];
    loop {
        match read_half.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let assembled = assembler.push(&tmp[..n]);
                for _ in 0..assembled.oversized {
                    let _ = events
                        .send(Event::ChannelError {
                            channel: id,
                            error: Error::OversizedMessage { limit: max_line },
                        })
                        .await;
                }
                for line in assembled.lines {
                    if events
                        .send(Event::ChannelLine { channel: id, line })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }
    debug!("Channel {id} closed by peer");
    let _ = events.send(Event::ChannelClosed { channel: id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[test]
    fn test_assembler_single_line() {
        let mut asm = LineAssembler::new(128);
        let out = asm.push(b">HOLD:Waiting\n");
        assert_eq!(out.lines, vec![">HOLD:Waiting".to_string()]);
        assert_eq!(asm.staged_len(), 0);
    }

    #[test]
    fn test_assembler_split_across_reads() {
        // The same line split at an arbitrary byte must yield exactly one line.
        let full = ">STATE:1,CONNECTED,SUCCESS,10.8.0.5,\n";
        for split in 1..full.len() - 1 {
            let mut asm = LineAssembler::new(128);
            let first = asm.push(&full.as_bytes()[..split]);
            let second = asm.push(&full.as_bytes()[split..]);
            let mut lines = first.lines;
            lines.extend(second.lines);
            assert_eq!(lines.len(), 1, "split at {split}");
            assert_eq!(lines[0], ">STATE:1,CONNECTED,SUCCESS,10.8.0.5,");
        }
    }

    #[test]
    fn test_assembler_strips_crlf() {
        let mut asm = LineAssembler::new(128);
        let out = asm.push(b"SUCCESS: ok\r\n");
        assert_eq!(out.lines, vec!["SUCCESS: ok".to_string()]);
    }

    #[test]
    fn test_assembler_multiple_lines_one_read() {
        let mut asm = LineAssembler::new(128);
        let out = asm.push(b"SUCCESS: a\n>INFO:b\npartial");
        assert_eq!(out.lines.len(), 2);
        assert_eq!(asm.staged_len(), "partial".len());
    }

    #[test]
    fn test_assembler_oversized_line_dropped() {
        let mut asm = LineAssembler::new(8);
        let out = asm.push(b"waytoolongline\nshort\n");
        assert_eq!(out.oversized, 1);
        assert_eq!(out.lines, vec!["short".to_string()]);
    }

    #[test]
    fn test_assembler_oversized_split_reads() {
        let mut asm = LineAssembler::new(8);
        let first = asm.push(b"waytoolong");
        assert_eq!(first.oversized, 1);
        let second = asm.push(b"stilltoolong\nok\n");
        assert_eq!(second.oversized, 0);
        assert_eq!(second.lines, vec!["ok".to_string()]);
    }

    #[tokio::test]
    async fn test_accept_and_read_events() {
        let pending = listen().await.unwrap();
        let addr = pending.local_addr;
        let channel = pending.id;
        let (tx, mut rx) = mpsc::channel(16);
        pending.spawn_accept(Duration::from_secs(5), 128, tx);

        let mut client = TcpStream::connect(addr).await.unwrap();
        match rx.recv().await.unwrap() {
            Event::ChannelConnected { channel: id, .. } => assert_eq!(id, channel),
            other => panic!("expected ChannelConnected, got {other:?}"),
        }

        // One line split across two writes
        client.write_all(b">HOLD:Wait").await.unwrap();
        client.flush().await.unwrap();
        client.write_all(b"ing\n").await.unwrap();
        client.shutdown().await.unwrap();

        match rx.recv().await.unwrap() {
            Event::ChannelLine { line, .. } => assert_eq!(line, ">HOLD:Waiting"),
            other => panic!("expected ChannelLine, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            Event::ChannelClosed { channel: id } => assert_eq!(id, channel),
            other => panic!("expected ChannelClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_accept_timeout_is_channel_unavailable() {
        let pending = listen().await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        pending.spawn_accept(Duration::from_millis(50), 128, tx);
        match rx.recv().await.unwrap() {
            Event::ChannelFailed {
                error: Error::ChannelUnavailable(_),
                ..
            } => {}
            other => panic!("expected ChannelFailed, got {other:?}"),
        }
    }
}

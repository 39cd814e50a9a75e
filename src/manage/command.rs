//! Management commands, the per-connection command queue, and secret storage.
//!
//! Commands are delivered strictly in submission order and only one may be
//! awaiting a reply at a time. Commands carrying a secret (the `password`
//! submission) are wiped from memory the moment their bytes have been written
//! to the channel; the queue keeps only an empty marker until the reply lands.

use std::collections::VecDeque;

/// Maximum parameters per command, including the command name itself.
pub const MAX_PARMS: usize = 5;

/// Overwrite a buffer with zeros through volatile writes so the wipe is not
/// optimized away.
fn wipe_bytes(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        // SAFETY: `b` is a valid, exclusive reference into the buffer.
        unsafe { std::ptr::write_volatile(b, 0) };
    }
}

fn wipe_string(s: &mut String) {
    // SAFETY: zero bytes are valid UTF-8, and the string is cleared after.
    unsafe { wipe_bytes(s.as_bytes_mut()) };
    s.clear();
}

/// A secret buffer, zeroed on drop.
///
/// Holds the cached connection password between the start request and the
/// `>PASSWORD:` prompts that consume it. Only [`Secret::expose`] reads it;
/// no owned copy outlives the wipe.
pub struct Secret(String);

impl Secret {
    pub fn new(value: &str) -> Self {
        Self(value.to_string())
    }

    /// Borrow the secret without copying it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        wipe_string(&mut self.0);
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(…)")
    }
}

/// Quote and escape a command argument (backslash and double-quote).
pub fn escape_arg(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for ch in arg.chars() {
        if ch == '\\' || ch == '"' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// One management-channel request line (without the trailing newline).
#[derive(Debug)]
pub struct ManageCommand {
    text: String,
    secret: bool,
}

impl ManageCommand {
    /// A plain command like `state on` or `signal SIGTERM`.
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            secret: false,
        }
    }

    /// A command with quoted, escaped arguments, e.g.
    /// `username "Auth" "alice"`. Arity is bounded by [`MAX_PARMS`].
    pub fn with_args(name: &str, args: &[&str]) -> Self {
        debug_assert!(1 + args.len() <= MAX_PARMS, "command arity over MAX_PARMS");
        let mut text = String::from(name);
        for arg in args {
            text.push(' ');
            text.push_str(&escape_arg(arg));
        }
        Self {
            text,
            secret: false,
        }
    }

    /// Like [`ManageCommand::with_args`] but wiped immediately after sending.
    pub fn secret(name: &str, args: &[&str]) -> Self {
        let mut cmd = Self::with_args(name, args);
        cmd.secret = true;
        cmd
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_secret(&self) -> bool {
        self.secret
    }

    /// Wipe the command text if it carries a secret. Called right after the
    /// bytes go out on the wire.
    pub fn wipe_if_secret(&mut self) {
        if self.secret {
            wipe_string(&mut self.text);
        }
    }
}

impl Drop for ManageCommand {
    fn drop(&mut self) {
        self.wipe_if_secret();
    }
}

/// FIFO queue of pending commands with a single in-flight slot.
///
/// `enqueue` never blocks; the channel writer promotes the head into the
/// in-flight slot, and a `SUCCESS:`/`ERROR:` reply releases it.
#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: VecDeque<ManageCommand>,
    in_flight: Option<ManageCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, cmd: ManageCommand) {
        self.pending.push_back(cmd);
    }

    /// Promote the queue head into the in-flight slot and return it for
    /// transmission. Returns `None` while a reply is still outstanding or the
    /// queue is empty; an already-promoted command is never handed out twice.
    pub fn promote(&mut self) -> Option<&mut ManageCommand> {
        if self.in_flight.is_some() {
            return None;
        }
        self.in_flight = self.pending.pop_front();
        self.in_flight.as_mut()
    }

    /// Consume the in-flight command on reply. Returns `false` when no command
    /// was outstanding (an unsolicited reply line).
    pub fn complete(&mut self) -> bool {
        self.in_flight.take().is_some()
    }

    /// Text of the outstanding command, if any. Empty for a secret command
    /// already wiped after transmission.
    pub fn in_flight_text(&self) -> Option<&str> {
        self.in_flight.as_ref().map(ManageCommand::text)
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Discard everything, wiping secrets. Used on disconnect and teardown.
    pub fn drain(&mut self) {
        for mut cmd in self.pending.drain(..) {
            cmd.wipe_if_secret();
        }
        if let Some(mut cmd) = self.in_flight.take() {
            cmd.wipe_if_secret();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_arg() {
        assert_eq!(escape_arg("alice"), "\"alice\"");
        assert_eq!(escape_arg("pa\"ss\\w"), "\"pa\\\"ss\\\\w\"");
    }

    #[test]
    fn test_with_args_quotes_each_argument() {
        let cmd = ManageCommand::with_args("username", &["Auth", "alice"]);
        assert_eq!(cmd.text(), "username \"Auth\" \"alice\"");
    }

    #[test]
    fn test_queue_is_fifo_with_single_in_flight() {
        let mut queue = CommandQueue::new();
        queue.enqueue(ManageCommand::plain("state on"));
        queue.enqueue(ManageCommand::plain("log on"));

        assert_eq!(queue.promote().unwrap().text(), "state on");
        // Second promote is a no-op until the reply arrives
        assert!(queue.promote().is_none());
        assert!(queue.has_in_flight());

        assert!(queue.complete());
        assert_eq!(queue.promote().unwrap().text(), "log on");
        assert!(queue.complete());
        assert!(!queue.has_in_flight());
        assert!(queue.promote().is_none());
    }

    #[test]
    fn test_secret_wiped_after_send_but_slot_held() {
        let mut queue = CommandQueue::new();
        queue.enqueue(ManageCommand::secret("password", &["Auth", "hunter2"]));

        let cmd = queue.promote().unwrap();
        assert!(cmd.text().contains("hunter2"));
        cmd.wipe_if_secret();
        assert!(cmd.text().is_empty());

        // Slot stays occupied until the reply, but nothing is re-sent
        assert!(queue.has_in_flight());
        assert!(queue.promote().is_none());
        assert!(queue.complete());
    }

    #[test]
    fn test_drain_discards_pending() {
        let mut queue = CommandQueue::new();
        queue.enqueue(ManageCommand::plain("state on"));
        queue.enqueue(ManageCommand::secret("password", &["Auth", "pw"]));
        queue.promote();
        queue.drain();
        assert!(!queue.has_in_flight());
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_secret_expose_borrows() {
        let secret = Secret::new("hunter2");
        assert_eq!(secret.expose(), "hunter2");
    }
}

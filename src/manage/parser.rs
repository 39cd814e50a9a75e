//! Management-channel line parsing.
//!
//! Every inbound line is either an async notice (`>`-prefixed), a reply to
//! the in-flight command (`SUCCESS:` / `ERROR:` / the `END` terminator of a
//! multi-line reply), or free-form text. Notices drive the connection state
//! machine; replies release the command queue's in-flight slot.

/// A parsed inbound management line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgmtLine {
    Notice(Notice),
    Reply(Reply),
    /// Peer software version, from the `version` command's reply body.
    Version(String),
    /// Anything unrecognized — logged and otherwise ignored.
    Other(String),
}

/// Async notification pushed by the managed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    State(StateNotice),
    /// `>PASSWORD:Need '<id>' ...` — the process wants credentials.
    PasswordNeed { id: String },
    /// `>PASSWORD:Verification Failed: '<id>' ['<reason>']`.
    /// A `CRV1:` reason is a dynamic challenge to be answered out of band.
    AuthFailed {
        id: String,
        challenge: Option<String>,
    },
    /// `>HOLD:` — the process waits for `hold release`.
    Hold,
    Info(String),
    Log(String),
    Fatal(String),
}

/// Reply line matched to the in-flight command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success(String),
    Error(String),
    /// Terminator of a multi-line reply body (e.g. `version`).
    End,
}

/// Well-known lifecycle states carried in a `>STATE:` notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Connected,
    Reconnecting,
    Exiting,
    Other,
}

/// A `>STATE:<ts>,<name>,<detail>,<ip>,...` notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateNotice {
    pub kind: StateKind,
    pub name: String,
    pub detail: String,
    /// Assigned tunnel address, present on `CONNECTED,SUCCESS`.
    pub ip: Option<String>,
}

/// Parse one complete line (terminator already stripped).
pub fn parse_line(line: &str) -> MgmtLine {
    if let Some(body) = line.strip_prefix('>') {
        let (tag, rest) = match body.split_once(':') {
            Some((tag, rest)) => (tag, rest),
            None => (body, ""),
        };
        return match tag {
            "STATE" => MgmtLine::Notice(Notice::State(parse_state(rest))),
            "PASSWORD" => MgmtLine::Notice(parse_password(rest)),
            "HOLD" => MgmtLine::Notice(Notice::Hold),
            "INFO" => MgmtLine::Notice(Notice::Info(rest.to_string())),
            "LOG" => MgmtLine::Notice(Notice::Log(rest.to_string())),
            "FATAL" => MgmtLine::Notice(Notice::Fatal(rest.to_string())),
            _ => MgmtLine::Other(line.to_string()),
        };
    }
    if let Some(msg) = line.strip_prefix("SUCCESS:") {
        return MgmtLine::Reply(Reply::Success(msg.trim().to_string()));
    }
    if let Some(msg) = line.strip_prefix("ERROR:") {
        return MgmtLine::Reply(Reply::Error(msg.trim().to_string()));
    }
    if line == "END" {
        return MgmtLine::Reply(Reply::End);
    }
    if let Some(version) = line.strip_prefix("OpenVPN Version:") {
        return MgmtLine::Version(version.trim().to_string());
    }
    MgmtLine::Other(line.to_string())
}

fn parse_state(body: &str) -> StateNotice {
    // Fields: timestamp,name,detail,ip,... — trailing fields vary by version.
    let mut fields = body.split(',');
    let _ts = fields.next();
    let name = fields.next().unwrap_or("").to_string();
    let detail = fields.next().unwrap_or("").to_string();
    let ip_field = fields.next().unwrap_or("");

    let kind = match name.as_str() {
        "CONNECTED" => StateKind::Connected,
        "RECONNECTING" => StateKind::Reconnecting,
        "EXITING" => StateKind::Exiting,
        _ => StateKind::Other,
    };
    let ip = if kind == StateKind::Connected && detail == "SUCCESS" && !ip_field.is_empty() {
        Some(ip_field.to_string())
    } else {
        None
    };
    StateNotice {
        kind,
        name,
        detail,
        ip,
    }
}

fn parse_password(body: &str) -> Notice {
    let body = body.trim();
    if let Some(rest) = body.strip_prefix("Verification Failed:") {
        let id = quoted_segment(rest).unwrap_or_default();
        let challenge = bracketed_reason(rest).filter(|r| r.starts_with("CRV1:"));
        return Notice::AuthFailed { id, challenge };
    }
    if let Some(rest) = body.strip_prefix("Need") {
        let id = quoted_segment(rest).unwrap_or_default();
        return Notice::PasswordNeed { id };
    }
    // Unrecognized password notice: surface as a generic request so the
    // machine still counts it toward the attempt limit.
    Notice::PasswordNeed {
        id: quoted_segment(body).unwrap_or_default(),
    }
}

/// Extract the text between the first pair of single quotes.
fn quoted_segment(s: &str) -> Option<String> {
    let start = s.find('\'')? + 1;
    let end = s[start..].find('\'')? + start;
    Some(s[start..end].to_string())
}

/// Extract the `['...']` reason trailer, if any.
fn bracketed_reason(s: &str) -> Option<String> {
    let start = s.find("['")? + 2;
    let end = s[start..].find("']")? + start;
    Some(s[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_connected() {
        let parsed = parse_line(">STATE:16520124,CONNECTED,SUCCESS,10.8.0.5,203.0.113.7,1194,,");
        let MgmtLine::Notice(Notice::State(state)) = parsed else {
            panic!("expected state notice, got {parsed:?}");
        };
        assert_eq!(state.kind, StateKind::Connected);
        assert_eq!(state.ip.as_deref(), Some("10.8.0.5"));
    }

    #[test]
    fn test_parse_state_reconnecting_has_no_ip() {
        let parsed = parse_line(">STATE:16520125,RECONNECTING,tls-error,,");
        let MgmtLine::Notice(Notice::State(state)) = parsed else {
            panic!("expected state notice");
        };
        assert_eq!(state.kind, StateKind::Reconnecting);
        assert_eq!(state.detail, "tls-error");
        assert!(state.ip.is_none());
    }

    #[test]
    fn test_parse_password_need() {
        let parsed = parse_line(">PASSWORD:Need 'Auth' username/password");
        assert_eq!(
            parsed,
            MgmtLine::Notice(Notice::PasswordNeed {
                id: "Auth".to_string()
            })
        );
    }

    #[test]
    fn test_parse_verification_failed() {
        let parsed = parse_line(">PASSWORD:Verification Failed: 'Auth'");
        assert_eq!(
            parsed,
            MgmtLine::Notice(Notice::AuthFailed {
                id: "Auth".to_string(),
                challenge: None
            })
        );
    }

    #[test]
    fn test_parse_dynamic_challenge() {
        let parsed =
            parse_line(">PASSWORD:Verification Failed: 'Auth' ['CRV1:R,E:abc:def:Enter token']");
        let MgmtLine::Notice(Notice::AuthFailed { challenge, .. }) = parsed else {
            panic!("expected auth failure");
        };
        assert_eq!(challenge.as_deref(), Some("CRV1:R,E:abc:def:Enter token"));
    }

    #[test]
    fn test_parse_replies() {
        assert_eq!(
            parse_line("SUCCESS: hold release succeeded"),
            MgmtLine::Reply(Reply::Success("hold release succeeded".to_string()))
        );
        assert_eq!(
            parse_line("ERROR: unknown command"),
            MgmtLine::Reply(Reply::Error("unknown command".to_string()))
        );
        assert_eq!(parse_line("END"), MgmtLine::Reply(Reply::End));
    }

    #[test]
    fn test_parse_version_line() {
        assert_eq!(
            parse_line("OpenVPN Version: OpenVPN 2.6.8 x86_64-pc-linux-gnu"),
            MgmtLine::Version("OpenVPN 2.6.8 x86_64-pc-linux-gnu".to_string())
        );
    }

    #[test]
    fn test_parse_hold_and_fatal() {
        assert_eq!(
            parse_line(">HOLD:Waiting for hold release:0"),
            MgmtLine::Notice(Notice::Hold)
        );
        assert_eq!(
            parse_line(">FATAL:Cannot resolve host"),
            MgmtLine::Notice(Notice::Fatal("Cannot resolve host".to_string()))
        );
    }

    #[test]
    fn test_unknown_line_is_other() {
        assert!(matches!(parse_line("gibberish"), MgmtLine::Other(_)));
    }
}

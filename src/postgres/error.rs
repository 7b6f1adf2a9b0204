//! Protocol-level and server-reported errors.
use bytes::{Buf, Bytes};

use crate::common::ByteStr;

/// A framing violation while translating backend bytes.
///
/// Protocol errors are fatal to their connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected backend message {}", fmt_unexpected(.expect, .found, .phase))]
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    #[error("unknown authentication request code {code}")]
    UnknownAuth { code: i32 },
    #[error("unknown transaction status byte {status}")]
    UnknownTransactionStatus { status: u8 },
    #[error("protocol string is not NUL terminated")]
    MissingNul,
    #[error("protocol string is not valid UTF-8: {0}")]
    NonUtf8(std::str::Utf8Error),
}

fn fmt_unexpected(expect: &Option<u8>, found: &u8, phase: &Option<&'static str>) -> String {
    use super::BackendMessage;
    let mut msg = format!("{:?}", BackendMessage::message_name(*found));
    if let Some(expect) = expect {
        msg.push_str(&format!(", expected {:?}", BackendMessage::message_name(*expect)));
    }
    if let Some(phase) = phase {
        msg.push_str(&format!(" during {phase}"));
    }
    msg
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: None }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected { expect: Some(expect), found, phase: None }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: Some(phase) }
    }

    pub(crate) fn unknown_auth(code: i32) -> ProtocolError {
        Self::UnknownAuth { code }
    }

    pub(crate) fn unknown_transaction_status(status: u8) -> ProtocolError {
        Self::UnknownTransactionStatus { status }
    }

    pub(crate) fn missing_nul() -> ProtocolError {
        Self::MissingNul
    }

    pub(crate) fn non_utf8(err: std::str::Utf8Error) -> ProtocolError {
        Self::NonUtf8(err)
    }
}

/// The identified fields of an ErrorResponse or NoticeResponse.
///
/// Each field is a one-byte code followed by a String value; a zero code
/// terminates the list. Unrecognized codes are silently ignored, since more
/// may be added in the future.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Debug, Default)]
pub struct ServerMessage {
    /// `V`: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO or LOG,
    /// never localized.
    pub severity: ByteStr,
    /// `S`: like `V` but possibly localized; the only severity field
    /// pre-9.6 servers send.
    pub severity_localized: ByteStr,
    /// `C`: the SQLSTATE code, five characters, the primary machine-readable
    /// discriminator.
    pub sqlstate: ByteStr,
    /// `M`: the primary human-readable message, one line.
    pub message: ByteStr,
    /// `D`: secondary message, possibly multi-line.
    pub detail: Option<ByteStr>,
    /// `H`: suggestion what to do about the problem.
    pub hint: Option<ByteStr>,
    /// `P`: 1-indexed character position in the original query.
    pub position: Option<u32>,
    /// `p`: like `P` but for `internal_query`.
    pub internal_position: Option<u32>,
    /// `q`: text of a failed internally-generated command.
    pub internal_query: Option<ByteStr>,
    /// `W`: call stack style context of where the error occurred.
    pub where_: Option<ByteStr>,
    /// `s`: schema name of the object the error is associated with.
    pub schema: Option<ByteStr>,
    /// `t`: table name.
    pub table: Option<ByteStr>,
    /// `c`: column name.
    pub column: Option<ByteStr>,
    /// `d`: data type name.
    pub data_type: Option<ByteStr>,
    /// `n`: constraint name.
    pub constraint: Option<ByteStr>,
    /// `F`: source file the error was reported from.
    pub file: Option<ByteStr>,
    /// `L`: source line the error was reported from.
    pub line: Option<u32>,
    /// `R`: source routine the error was reported from.
    pub routine: Option<ByteStr>,
}

impl ServerMessage {
    pub(crate) fn parse(mut body: Bytes) -> Result<Self, ProtocolError> {
        use crate::ext::BytesExt;

        let mut fields = ServerMessage::default();

        loop {
            let code = body.get_u8();
            if code == b'\0' {
                break;
            }
            let value = body.get_cstr()?;
            match code {
                b'V' => fields.severity = value,
                b'S' => fields.severity_localized = value,
                b'C' => fields.sqlstate = value,
                b'M' => fields.message = value,
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                b'P' => fields.position = value.parse().ok(),
                b'p' => fields.internal_position = value.parse().ok(),
                b'q' => fields.internal_query = Some(value),
                b'W' => fields.where_ = Some(value),
                b's' => fields.schema = Some(value),
                b't' => fields.table = Some(value),
                b'c' => fields.column = Some(value),
                b'd' => fields.data_type = Some(value),
                b'n' => fields.constraint = Some(value),
                b'F' => fields.file = Some(value),
                b'L' => fields.line = value.parse().ok(),
                b'R' => fields.routine = Some(value),
                _ => {}
            }
        }

        if fields.severity.is_empty() {
            fields.severity = fields.severity_localized.clone();
        }

        Ok(fields)
    }
}

macro_rules! fmt_server_message {
    () => {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}: {}", self.0.severity, self.0.message)?;
            if !self.0.sqlstate.is_empty() {
                write!(f, " (SQLSTATE {})", self.0.sqlstate)?;
            }
            if let Some(detail) = &self.0.detail {
                write!(f, "\nDETAIL: {detail}")?;
            }
            if let Some(hint) = &self.0.hint {
                write!(f, "\nHINT: {hint}")?;
            }
            Ok(())
        }
    };
}

/// An error reported by the server.
///
/// The containing Sync still closes the pipeline, so the connection stays
/// usable after one of these.
#[derive(Debug)]
pub struct ServerError(pub ServerMessage);

impl ServerError {
    /// The SQLSTATE code.
    pub fn sqlstate(&self) -> &str {
        &self.0.sqlstate
    }

    pub fn message(&self) -> &str {
        &self.0.message
    }

    pub fn fields(&self) -> &ServerMessage {
        &self.0
    }
}

impl std::error::Error for ServerError {}

impl std::fmt::Display for ServerError {
    fmt_server_message!();
}

/// A warning delivered to the notice listener.
#[derive(Debug)]
pub struct Notice(pub ServerMessage);

impl Notice {
    pub fn severity(&self) -> &str {
        &self.0.severity
    }

    pub fn sqlstate(&self) -> &str {
        &self.0.sqlstate
    }

    pub fn message(&self) -> &str {
        &self.0.message
    }

    pub fn fields(&self) -> &ServerMessage {
        &self.0
    }
}

impl std::fmt::Display for Notice {
    fmt_server_message!();
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BufMut;

    fn field(buf: &mut Vec<u8>, code: u8, value: &str) {
        buf.put_u8(code);
        buf.put_slice(value.as_bytes());
        buf.put_u8(0);
    }

    #[test]
    fn parses_known_and_skips_unknown_fields() {
        let mut buf = Vec::new();
        field(&mut buf, b'S', "ERROR");
        field(&mut buf, b'V', "ERROR");
        field(&mut buf, b'C', "42P01");
        field(&mut buf, b'M', "relation \"foo\" does not exist");
        field(&mut buf, b'P', "15");
        field(&mut buf, b'L', "1452");
        field(&mut buf, b'Z', "future field");
        buf.put_u8(0);

        let fields = ServerMessage::parse(Bytes::from(buf)).unwrap();
        assert_eq!(fields.severity, "ERROR");
        assert_eq!(fields.sqlstate, "42P01");
        assert_eq!(fields.position, Some(15));
        assert_eq!(fields.line, Some(1452));
        assert!(fields.table.is_none());
    }

    #[test]
    fn severity_falls_back_to_localized() {
        let mut buf = Vec::new();
        field(&mut buf, b'S', "FEHLER");
        field(&mut buf, b'C', "0A000");
        field(&mut buf, b'M', "nicht unterstuetzt");
        buf.put_u8(0);

        let fields = ServerMessage::parse(Bytes::from(buf)).unwrap();
        assert_eq!(fields.severity, "FEHLER");
    }
}

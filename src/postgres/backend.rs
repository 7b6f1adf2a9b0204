//! Postgres backend messages.
use bytes::{Buf, Bytes};

use super::{
    Oid,
    error::{ProtocolError, ServerMessage},
};
use crate::{common::ByteStr, ext::BytesExt};

/// A type that can be decoded from a postgres backend message.
pub trait BackendProtocol: Sized {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

/// Any backend message the protocol engine routes.
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    CommandComplete(CommandComplete),
    DataRow(DataRow),
    EmptyQueryResponse(EmptyQueryResponse),
    ErrorResponse(ErrorResponse),
    NegotiateProtocolVersion(NegotiateProtocolVersion),
    NoData(NoData),
    NoticeResponse(NoticeResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete(ParseComplete),
    PortalSuspended(PortalSuspended),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }

            /// Message name for a message type byte, `"Unknown"` otherwise.
            pub fn message_name(msgtype: u8) -> &'static str {
                match msgtype {
                    $($name::MSGTYPE => stringify!($name),)*
                    _ => "Unknown",
                }
            }
        }

        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => return Err(ProtocolError::unknown(msgtype)),
                };
                Ok(message)
            }
        }
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    DataRow,
    EmptyQueryResponse,
    ErrorResponse,
    NegotiateProtocolVersion,
    NoData,
    NoticeResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

macro_rules! assert_msgtype {
    ($typ:ident) => {
        if Self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected(Self::MSGTYPE, $typ));
        }
    };
}

/// An authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// `Int32(0)` authentication was successful.
    Ok,
    /// `Int32(2)` Kerberos V5 authentication is required.
    KerberosV5,
    /// `Int32(3)` a clear-text password is required.
    CleartextPassword,
    /// `Int32(5)` an MD5-encrypted password is required.
    MD5Password {
        /// The salt to use when encrypting the password.
        salt: [u8; 4],
    },
    /// `Int32(7)` GSSAPI authentication is required.
    Gss,
    /// `Int32(9)` SSPI authentication is required.
    Sspi,
    /// `Int32(10)` SASL authentication is required; the body lists the
    /// mechanisms in the server's order of preference.
    Sasl,
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let auth = match body.get_i32() {
            0 => Authentication::Ok,
            2 => Authentication::KerberosV5,
            3 => Authentication::CleartextPassword,
            5 => {
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Authentication::MD5Password { salt }
            }
            7 => Authentication::Gss,
            9 => Authentication::Sspi,
            10 => Authentication::Sasl,
            code => return Err(ProtocolError::unknown_auth(code)),
        };
        Ok(auth)
    }
}

/// Cancellation key data.
///
/// The frontend must save these values to be able to issue CancelRequest
/// messages later.
#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: i32,
    /// The secret key of this backend.
    pub secret_key: i32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            process_id: body.get_i32(),
            secret_key: body.get_i32(),
        })
    }
}

/// A run-time parameter status report.
///
/// Sent at startup for every reported parameter and again whenever one of
/// them changes mid-session.
#[derive(Debug)]
pub struct ParameterStatus {
    pub name: ByteStr,
    pub value: ByteStr,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            name: body.get_cstr()?,
            value: body.get_cstr()?,
        })
    }
}

/// Backend transaction status, reported by every ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `'I'`: not in a transaction block.
    Idle,
    /// `'T'`: in a transaction block.
    InTransaction,
    /// `'E'`: in a failed transaction block, queries rejected until
    /// the block ends.
    InFailedTransaction,
}

/// The backend's turn-taking fence: ready for a new query cycle.
///
/// Sent once for every Sync of the extended protocol and at the end of every
/// simple-query cycle.
#[derive(Debug)]
pub struct ReadyForQuery {
    pub status: TransactionStatus,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let status = match body.get_u8() {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::InFailedTransaction,
            other => return Err(ProtocolError::unknown_transaction_status(other)),
        };
        Ok(Self { status })
    }
}

/// Column metadata preceding a result's data rows.
///
/// `Int16` field count, then per field: name String, table OID `Int32`,
/// column attribute number `Int16`, type OID `Int32`, type size `Int16`,
/// type modifier `Int32`, format code `Int16`. Fields decode lazily through
/// [`crate::column::FieldDescription`].
#[derive(Debug)]
pub struct RowDescription {
    /// Number of fields in a row (can be zero).
    pub field_len: i16,
    pub body: Bytes,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            field_len: body.get_i16(),
            body,
        })
    }
}

/// One row of a result.
///
/// `Int16` column count, then per column `Int32` length + bytes; length -1
/// is NULL. Columns decode lazily from the detached body.
#[derive(Debug)]
pub struct DataRow {
    pub column_len: i16,
    pub body: Bytes,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            column_len: body.get_i16(),
            body,
        })
    }
}

/// A command-completed response carrying the command tag,
/// e.g. `INSERT 0 1` or `SELECT 42`.
#[derive(Debug)]
pub struct CommandComplete {
    pub tag: ByteStr,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { tag: body.get_cstr()? })
    }
}

/// OIDs of a described statement's parameters.
#[derive(Debug)]
pub struct ParameterDescription {
    /// The number of parameters used by the statement (can be zero).
    pub param_len: i16,
    oids: Bytes,
}

impl ParameterDescription {
    pub const MSGTYPE: u8 = b't';

    pub fn oids(&self) -> impl Iterator<Item = Oid> + '_ {
        let mut body = self.oids.clone();
        (0..self.param_len).map(move |_| body.get_u32())
    }
}

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            param_len: body.get_i16(),
            oids: body,
        })
    }
}

/// The server declined the requested minor protocol version.
#[derive(Debug)]
pub struct NegotiateProtocolVersion {
    /// Newest minor protocol version supported for the requested major.
    pub minor: i32,
    /// Number of protocol options not recognized by the server.
    pub unrecognized_len: i32,
    /// The unrecognized option names.
    pub options: Bytes,
}

impl NegotiateProtocolVersion {
    pub const MSGTYPE: u8 = b'v';
}

impl BackendProtocol for NegotiateProtocolVersion {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            minor: body.get_i32(),
            unrecognized_len: body.get_i32(),
            options: body,
        })
    }
}

/// A server error.
///
/// The body is identified fields terminated by a zero byte; see
/// [`ServerMessage`] for the field codes.
#[derive(Debug)]
pub struct ErrorResponse {
    pub fields: ServerMessage,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { fields: ServerMessage::parse(body)? })
    }
}

/// A warning message with the same field layout as [`ErrorResponse`].
///
/// Notices are not errors; execution continues around them.
#[derive(Debug)]
pub struct NoticeResponse {
    pub fields: ServerMessage,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { fields: ServerMessage::parse(body)? })
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl $name {
            pub const MSGTYPE: u8 = $ty;
        }

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, _: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!(msgtype);
                Ok(Self)
            }
        }
    )*};
}

unit_msg! {
    /// A Parse-complete indicator.
    struct ParseComplete, b'1';

    /// A Bind-complete indicator.
    struct BindComplete, b'2';

    /// A Close-complete indicator.
    struct CloseComplete, b'3';

    /// Response to an empty query string, substituting for CommandComplete.
    struct EmptyQueryResponse, b'I';

    /// A no-data indicator: the described statement returns no rows.
    struct NoData, b'n';

    /// An Execute row-count limit was reached; the portal is suspended and
    /// can be executed again to continue.
    struct PortalSuspended, b's';
}

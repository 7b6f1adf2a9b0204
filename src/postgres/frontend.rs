//! Postgres frontend messages.
//!
//! Struct fields mirror the wire layout of the message they encode.
use bytes::BufMut;

use super::{CANCEL_REQUEST_CODE, Oid, PROTOCOL_VERSION, PgFormat};
use crate::{
    encode::BindValue,
    ext::{BufMutExt, StrExt, UsizeExt},
};

/// A type which can be encoded as a postgres frontend message.
///
/// The startup message and the cancel request have no message-type byte and
/// therefore write themselves instead of implementing this trait.
pub trait FrontendProtocol {
    /// Message type byte.
    const MSGTYPE: u8;

    /// Size of the message body, excluding the type byte and length field.
    ///
    /// Writing more or less than this is a framing bug; [`write`] asserts it.
    fn size_hint(&self) -> i32;

    /// Write the message body.
    fn encode(self, buf: impl BufMut);
}

/// Total frame size of a message: type byte + length field + body.
pub fn frame_len<F: FrontendProtocol>(msg: &F) -> usize {
    1 + 4 + msg.size_hint() as usize
}

/// Write a complete frame, header included, to `buf`.
///
/// The caller guarantees `buf` has [`frame_len`] bytes of room.
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut impl BufMut) {
    let size = msg.size_hint();
    buf.put_u8(F::MSGTYPE);
    buf.put_i32(4 + size);
    msg.encode(buf);
}

/// The very first message of a session.
///
/// `Int32` length, `Int32` protocol version, then pairs of parameter
/// name/value strings terminated by a zero byte. Parameter names other than
/// `user`, `database` and `replication` are treated as run-time parameters
/// applied at backend start.
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Additional run-time parameters to apply as session defaults,
    /// e.g. `application_name` or `search_path`.
    pub params: &'a [(&'a str, &'a str)],
}

impl Startup<'_> {
    pub fn size(&self) -> i32 {
        let mut size = 4 + 4;
        size += "user".cstr_len() + self.user.cstr_len();
        if let Some(db) = self.database {
            size += "database".cstr_len() + db.cstr_len();
        }
        for (name, value) in self.params {
            size += name.cstr_len() + value.cstr_len();
        }
        size + 1
    }

    pub fn write(self, mut buf: impl BufMut) {
        buf.put_i32(self.size());
        buf.put_i32(PROTOCOL_VERSION);

        buf.put_cstr("user");
        buf.put_cstr(self.user);

        if let Some(db) = self.database {
            buf.put_cstr("database");
            buf.put_cstr(db);
        }

        for (name, value) in self.params {
            buf.put_cstr(name);
            buf.put_cstr(value);
        }

        buf.put_u8(b'\0');
    }
}

/// Out-of-band query cancellation, sent on its own connection.
///
/// Carries the process id and secret key from BackendKeyData; the backend
/// gives no reply and the connection is closed right after.
#[derive(Debug)]
pub struct CancelRequest {
    pub process_id: i32,
    pub secret_key: i32,
}

impl CancelRequest {
    pub const SIZE: i32 = 16;

    pub fn write(self, mut buf: impl BufMut) {
        buf.put_i32(Self::SIZE);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
    }
}

/// Password response to an authentication request.
///
/// The payload is cleartext or MD5-hashed depending on what was requested.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.password.cstr_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_cstr(self.password);
    }
}

/// A simple-protocol query.
pub struct Query<'a> {
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn size_hint(&self) -> i32 {
        self.sql.cstr_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_cstr(self.sql);
    }
}

/// A Parse command, creating a prepared statement.
pub struct Parse<'a, I> {
    /// Prepared statement name; empty selects the unnamed statement.
    pub statement_name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// The number of parameter data types prespecified (can be zero).
    ///
    /// This is not the number of parameters in the query string, only the
    /// number the frontend wants to prespecify types for.
    pub oids_len: i16,
    /// Parameter data type OIDs; zero leaves a type unspecified.
    pub oids: I,
}

impl<I> FrontendProtocol for Parse<'_, I>
where
    I: IntoIterator<Item = Oid>,
{
    const MSGTYPE: u8 = b'P';

    fn size_hint(&self) -> i32 {
        self.statement_name.cstr_len() + self.sql.cstr_len() + 2 + (self.oids_len as i32 * 4)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_cstr(self.statement_name);
        buf.put_cstr(self.sql);
        buf.put_i16(self.oids_len);
        for oid in self.oids {
            buf.put_u32(oid);
        }
    }
}

/// A Bind command, creating a portal from a prepared statement.
///
/// `P` is anything presenting a [`BindValue`], so both bare encoded values
/// and full statement parameters bind without copying.
pub struct Bind<'a, P> {
    /// Destination portal name; empty selects the unnamed portal.
    pub portal_name: &'a str,
    /// Source prepared statement name; empty selects the unnamed statement.
    pub statement_name: &'a str,
    /// Parameter format codes. Zero entries means all-text, one entry
    /// applies to every parameter, otherwise one per parameter.
    pub param_formats: &'a [PgFormat],
    /// Parameter values, each framed as `Int32` length + bytes;
    /// length -1 is NULL and no bytes follow.
    pub params: &'a [P],
    /// Result-column format codes, same cardinality rules as
    /// `param_formats`.
    pub result_formats: &'a [PgFormat],
}

impl<P> FrontendProtocol for Bind<'_, P>
where
    P: BindValue,
{
    const MSGTYPE: u8 = b'B';

    fn size_hint(&self) -> i32 {
        self.portal_name.cstr_len()
            + self.statement_name.cstr_len()
            + 2
            + (self.param_formats.len() as i32 * 2)
            + 2
            + self
                .params
                .iter()
                .fold(0i32, |acc, p| acc + 4 + p.wire_len().max(0))
            + 2
            + (self.result_formats.len() as i32 * 2)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_cstr(self.portal_name);
        buf.put_cstr(self.statement_name);

        buf.put_i16(self.param_formats.len().to_i16());
        for format in self.param_formats {
            buf.put_i16(format.format_code());
        }

        buf.put_i16(self.params.len().to_i16());
        for param in self.params {
            buf.put_i32(param.wire_len());
            buf.put_slice(param.as_slice());
        }

        buf.put_i16(self.result_formats.len().to_i16());
        for format in self.result_formats {
            buf.put_i16(format.format_code());
        }
    }
}

/// A Describe command.
pub struct Describe<'a> {
    /// `'S'` to describe a prepared statement, `'P'` a portal.
    pub kind: u8,
    /// Name of the statement or portal; empty selects the unnamed one.
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn size_hint(&self) -> i32 {
        1 + self.name.cstr_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_cstr(self.name);
    }
}

/// An Execute command, running a portal.
pub struct Execute<'a> {
    /// Name of the portal to execute; empty selects the unnamed portal.
    pub portal_name: &'a str,
    /// Maximum number of rows to return if the portal returns rows,
    /// ignored otherwise. Zero denotes no limit.
    pub max_rows: i32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn size_hint(&self) -> i32 {
        self.portal_name.cstr_len() + 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_cstr(self.portal_name);
        buf.put_i32(self.max_rows);
    }
}

/// A Close command, releasing a prepared statement or portal.
pub struct Close<'a> {
    /// `'S'` to close a prepared statement, `'P'` a portal.
    pub kind: u8,
    /// Name of the statement or portal; empty selects the unnamed one.
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> i32 {
        1 + self.name.cstr_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_cstr(self.name);
    }
}

macro_rules! header_only {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl FrontendProtocol for $name {
            const MSGTYPE: u8 = $ty;

            fn size_hint(&self) -> i32 {
                0
            }

            fn encode(self, _: impl BufMut) {}
        }
    )*};
}

header_only! {
    /// Closes the current pipeline; answered with ReadyForQuery.
    struct Sync, b'S';

    /// Asks the backend to deliver pending output without closing the
    /// pipeline.
    struct Flush, b'H';

    /// Orderly session shutdown; no response follows.
    struct Terminate, b'X';
}

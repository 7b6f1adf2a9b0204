//! Postgres frontend and backend protocol, version 3.
//!
//! All communication is a stream of messages. The first byte identifies the
//! message type, the next four bytes give the length of the rest of the
//! message (the length includes itself but not the type byte):
//!
//! ```text
//! | u8 |        i32        | body
//! |----|-------------------|-----
//! | 54 | 00 | 00 | 00 | 32 |  ..
//! ```
//!
//! For historical reasons the very first message sent by the client (the
//! startup message) has no message-type byte, and neither does the cancel
//! request which travels on its own short-lived connection.
//!
//! # Extended query
//!
//! The extended-query cycle consists of a Parse step creating a prepared
//! statement from a textual query, a Bind step creating a portal from a
//! prepared statement plus parameter values, and an Execute step running the
//! portal. A pipeline batches those for any number of statements and is
//! fenced by a single Sync, which the backend answers with ReadyForQuery.
//!
//! <https://www.postgresql.org/docs/17/protocol-overview.html>

pub mod backend;
pub mod error;
pub mod frontend;

mod pg_format;
mod pg_type;

pub use backend::{BackendMessage, BackendProtocol, TransactionStatus};
pub use error::{Notice, ProtocolError, ServerError, ServerMessage};
pub use frontend::FrontendProtocol;
pub use pg_format::PgFormat;
pub use pg_type::{Oid, PgType, oid};

/// Protocol version 3.0: major 3 in the high 16 bits, minor 0 in the low.
pub const PROTOCOL_VERSION: i32 = 196608;

/// Magic version number of the out-of-band cancel request.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

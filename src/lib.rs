//! PostgreSQL wire-protocol client with pipelined extended queries and
//! connection pooling.
//!
//! # Examples
//!
//! A single connection:
//!
//! ```no_run
//! use postgate::{Connector, Config, Statement};
//!
//! # async fn app() -> postgate::Result<()> {
//! let config = Config::parse("Host=localhost;Username=app;Password=secret;Database=app")?;
//! let mut conn = Connector::open(config).await?;
//!
//! let mut stmts = [Statement::new("SELECT $1").bind(8)];
//! let mut reader = conn.execute(&mut stmts).await?;
//! while let Some(row) = reader.read().await? {
//!     let n: i32 = row.try_get(0)?;
//!     assert_eq!(n, 8);
//! }
//! reader.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The shared pool for a connection string:
//!
//! ```no_run
//! use postgate::{Statement, pool::manager};
//!
//! # async fn app() -> postgate::Result<()> {
//! let pool = manager::pool_for("Host=localhost;Username=app;MaxPoolSize=10")?;
//!
//! let mut conn = pool.acquire().await?;
//! let mut stmts = [Statement::new("SELECT count(*) FROM users")];
//! let mut reader = conn.execute(&mut stmts).await?;
//! let count: i64 = reader.read().await?.expect("one row").try_get(0)?;
//! reader.close().await?;
//! drop(reader);
//! conn.release().await?;
//! # let _ = count;
//! # Ok(())
//! # }
//! ```

pub mod common;
mod ext;
mod net;

// Wire layer
pub mod io;
pub mod postgres;

// Encoding
pub mod encode;
mod value;

// Components
pub mod column;
pub mod row;
pub mod statement;
pub mod types;

// Engine
pub mod config;
pub mod connector;
pub mod reader;

// Pooling
pub mod pool;

#[cfg(feature = "blocking")]
pub mod blocking;

mod error;

#[doc(inline)]
pub use config::Config;
#[doc(inline)]
pub use connector::{Connector, ConnectorState};
#[doc(inline)]
pub use encode::Encode;
#[doc(inline)]
pub use error::{Error, ErrorKind, Result, TimeoutKind};
#[doc(inline)]
pub use pool::{Pool, PoolConnection, connect};
#[doc(inline)]
pub use postgres::{Notice, TransactionStatus};
#[doc(inline)]
pub use reader::DataReader;
#[doc(inline)]
pub use row::Row;
#[doc(inline)]
pub use statement::{ParamDirection, Parameter, Statement, StatementType};
#[doc(inline)]
pub use types::{Decode, PgValue};

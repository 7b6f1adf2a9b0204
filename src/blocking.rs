//! A synchronous façade over the async core.
//!
//! The protocol engine has a single implementation; this module drives it
//! on an owned current-thread runtime, so blocking callers get the same
//! byte-level behavior as async ones.
use crate::{Config, Connector, Result, Row, Statement};

/// A blocking postgres client owning one connection.
pub struct Client {
    runtime: tokio::runtime::Runtime,
    conn: Connector,
}

impl Client {
    /// Connect with a `key=value;` connection string.
    pub fn connect(conn_str: &str) -> Result<Client> {
        Self::connect_with(Config::parse(conn_str)?)
    }

    pub fn connect_with(config: Config) -> Result<Client> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(crate::Error::from)?;
        let conn = runtime.block_on(Connector::open(config))?;
        Ok(Client { runtime, conn })
    }

    /// Execute statements that return no interesting rows; the summed
    /// affected-row count is returned.
    pub fn execute(&mut self, statements: &mut [Statement<'_>]) -> Result<u64> {
        let Client { runtime, conn } = self;
        runtime.block_on(async {
            let mut reader = conn.execute(statements).await?;
            reader.close().await?;
            drop(reader);
            Ok(statements.iter().map(Statement::rows_affected).sum())
        })
    }

    /// Run one statement and collect every row of its result.
    pub fn query(&mut self, statement: &mut Statement<'_>) -> Result<Vec<Row>> {
        let Client { runtime, conn } = self;
        runtime.block_on(async {
            let statements = std::slice::from_mut(statement);
            let mut reader = conn.execute(statements).await?;
            let mut rows = Vec::new();
            while let Some(row) = reader.read().await? {
                rows.push(row);
            }
            reader.close().await?;
            Ok(rows)
        })
    }

    /// The underlying connector, for state inspection.
    pub fn connector(&self) -> &Connector {
        &self.conn
    }

    /// Terminate the session.
    pub fn close(self) -> Result<()> {
        let Client { runtime, conn } = self;
        runtime.block_on(conn.close())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("conn", &self.conn).finish()
    }
}

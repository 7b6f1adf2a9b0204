//! Forward-only cursor over pipeline results.
use std::{
    pin::Pin,
    task::{Context, Poll, ready},
};

use futures_core::Stream;

use crate::{
    Error, Result,
    column::FieldDescription,
    connector::{Connector, ConnectorState},
    error::{ErrorKind, TimeoutKind},
    postgres::{ProtocolError, backend::BackendMessage},
    row::Row,
    statement::{Outcome, Statement},
};

/// A forward-only cursor over the results of an executed pipeline.
///
/// [`DataReader::read`] yields the rows of the current statement;
/// [`DataReader::next_result`] advances to the next statement. Statement
/// outcomes (command tag, row counts, column metadata) become visible on
/// the statements as each result completes.
///
/// Dropping the reader mid-pipeline is safe: the connector drains the
/// remaining responses lazily before its next use.
pub struct DataReader<'c, 'q> {
    conn: &'c mut Connector,
    statements: &'c mut [Statement<'q>],
    cur: usize,
    state: ReaderState,
    /// Rows delivered for the current result, for suspended outcomes.
    result_rows: u64,
    deadline: Option<tokio::time::Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    /// Streaming the current statement's responses.
    InStatement,
    /// The current statement completed; waiting for `next_result`.
    BetweenResults,
    /// Every statement completed and the pipeline fence was consumed.
    Finished,
    /// A server or protocol error ended the pipeline.
    Errored,
    /// Closed by the caller.
    Closed,
}

impl<'c, 'q> DataReader<'c, 'q> {
    pub(crate) fn new(
        conn: &'c mut Connector,
        statements: &'c mut [Statement<'q>],
        deadline: Option<tokio::time::Instant>,
    ) -> Self {
        let state = match statements.is_empty() {
            true => ReaderState::Finished,
            false => ReaderState::InStatement,
        };
        Self {
            conn,
            statements,
            cur: 0,
            state,
            result_rows: 0,
            deadline,
        }
    }

    /// Index of the statement whose result is current.
    pub fn statement_index(&self) -> usize {
        self.cur
    }

    /// Column metadata of the current result, once it is known.
    pub fn columns(&self) -> Option<&[FieldDescription]> {
        self.statements
            .get(self.cur)
            .and_then(|s| s.columns.as_deref())
    }

    /// Outcome of the current statement, present once its result completed.
    pub fn outcome(&self) -> Option<&Outcome> {
        self.statements.get(self.cur).and_then(|s| s.outcome.as_ref())
    }

    /// Pull the next row of the current result.
    ///
    /// `None` means the current result is done; call
    /// [`DataReader::next_result`] to move on.
    pub async fn read(&mut self) -> Result<Option<Row>> {
        match self.deadline {
            None => std::future::poll_fn(|cx| self.poll_read(cx)).await,
            Some(deadline) => {
                let step = tokio::time::timeout_at(
                    deadline,
                    std::future::poll_fn(|cx| self.poll_read(cx)),
                );
                match step.await {
                    Ok(res) => res,
                    Err(_elapsed) => Err(self.command_timeout().await),
                }
            }
        }
    }

    /// Advance past any unread rows of the current result and position at
    /// the next statement's result.
    ///
    /// Returns `false` once the pipeline's ReadyForQuery has been consumed
    /// and the connector is Ready again.
    pub async fn next_result(&mut self) -> Result<bool> {
        loop {
            match self.state {
                ReaderState::InStatement => {
                    // skip the rest of the current result
                    while self.read().await?.is_some() {}
                }
                ReaderState::BetweenResults => {
                    self.cur += 1;
                    self.result_rows = 0;
                    if self.cur < self.statements.len() {
                        self.state = ReaderState::InStatement;
                        return Ok(true);
                    }
                    // the only message left in the flight is the Sync fence
                    self.conn.note_sync_pending();
                    self.conn.ready().await?;
                    self.state = ReaderState::Finished;
                    return Ok(false);
                }
                ReaderState::Finished => return Ok(false),
                ReaderState::Errored | ReaderState::Closed => {
                    return Err(Error::invalid_op("reading past the end of the results"));
                }
            }
        }
    }

    /// Drain every remaining result so the connector returns to Ready.
    pub async fn close(&mut self) -> Result<()> {
        if matches!(self.state, ReaderState::Closed) {
            return Ok(());
        }
        if matches!(self.state, ReaderState::Errored) {
            self.state = ReaderState::Closed;
            return Ok(());
        }
        while self.next_result().await? {}
        self.state = ReaderState::Closed;
        Ok(())
    }

    fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Row>>> {
        let stmt = match self.state {
            ReaderState::InStatement => &mut self.statements[self.cur],
            ReaderState::BetweenResults | ReaderState::Finished => {
                return Poll::Ready(Ok(None));
            }
            ReaderState::Errored | ReaderState::Closed => {
                return Poll::Ready(Err(Error::invalid_op(
                    "reading past the end of the results",
                )));
            }
        };

        loop {
            let msg = match ready!(self.conn.poll_recv::<BackendMessage>(cx)) {
                Ok(msg) => msg,
                Err(err) => {
                    self.state = ReaderState::Errored;
                    return Poll::Ready(Err(err));
                }
            };

            match msg {
                // positive acknowledgements of our Parse and Bind
                BackendMessage::ParseComplete(_) | BackendMessage::BindComplete(_) => {}
                // from Describe: the statement's parameter types
                BackendMessage::ParameterDescription(_) => {}
                // from Describe: this statement produces rows
                BackendMessage::RowDescription(rd) => {
                    match FieldDescription::decode_all(&rd) {
                        Ok(cols) => stmt.columns = Some(cols),
                        Err(err) => {
                            self.state = ReaderState::Errored;
                            self.conn.set_state(ConnectorState::Broken);
                            return Poll::Ready(Err(err.into()));
                        }
                    }
                }
                // from Describe: this statement produces no rows
                BackendMessage::NoData(_) => stmt.columns = None,
                BackendMessage::DataRow(dr) => {
                    let Some(cols) = stmt.columns.clone() else {
                        self.state = ReaderState::Errored;
                        self.conn.set_state(ConnectorState::Broken);
                        let err = ProtocolError::unexpected_phase(b'D', "row without description");
                        return Poll::Ready(Err(err.into()));
                    };
                    self.result_rows += 1;
                    return Poll::Ready(Ok(Some(Row::new(cols, dr))));
                }
                BackendMessage::CommandComplete(cc) => {
                    stmt.outcome = Some(Outcome::from_tag(&cc.tag));
                    self.state = ReaderState::BetweenResults;
                    return Poll::Ready(Ok(None));
                }
                BackendMessage::EmptyQueryResponse(_) => {
                    stmt.outcome = Some(Outcome::empty());
                    self.state = ReaderState::BetweenResults;
                    return Poll::Ready(Ok(None));
                }
                BackendMessage::PortalSuspended(_) => {
                    let mut outcome = Outcome::suspended();
                    outcome.rows = self.result_rows;
                    stmt.outcome = Some(outcome);
                    self.state = ReaderState::BetweenResults;
                    return Poll::Ready(Ok(None));
                }
                other => {
                    self.state = ReaderState::Errored;
                    self.conn.set_state(ConnectorState::Broken);
                    let err = ProtocolError::unexpected_phase(other.msgtype(), "row fetch");
                    return Poll::Ready(Err(err.into()));
                }
            }
        }
    }

    /// The command deadline elapsed: fire a CancelRequest on a secondary
    /// connection and give the server a short grace period to wind the
    /// pipeline down. A server that stays silent leaves the connector
    /// Broken.
    async fn command_timeout(&mut self) -> Error {
        const GRACE: std::time::Duration = std::time::Duration::from_secs(5);

        let _ = self.conn.cancel().await;

        let drained = tokio::time::timeout(GRACE, async {
            loop {
                match std::future::poll_fn(|cx| self.poll_read(cx)).await {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
        })
        .await;

        match drained {
            // the fence of the interrupted pipeline is still outstanding
            Ok(()) => {
                if matches!(
                    self.state,
                    ReaderState::InStatement | ReaderState::BetweenResults
                ) {
                    self.conn.note_sync_pending();
                }
            }
            Err(_silent) => self.conn.set_state(ConnectorState::Broken),
        }
        self.state = ReaderState::Errored;
        ErrorKind::Timeout(TimeoutKind::Command).into()
    }
}

impl Drop for DataReader<'_, '_> {
    fn drop(&mut self) {
        // an unconsumed pipeline still owes the connection one Sync fence;
        // record it so the next user drains to ReadyForQuery first
        if matches!(
            self.state,
            ReaderState::InStatement | ReaderState::BetweenResults
        ) {
            self.conn.note_sync_pending();
        }
    }
}

/// Rows of the current result as a stream.
///
/// The stream cannot fire the cancel request from inside `poll_next`, so
/// an elapsed command deadline surfaces as a plain timeout error here.
impl Stream for DataReader<'_, '_> {
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(deadline) = this.deadline {
            if tokio::time::Instant::now() >= deadline
                && matches!(
                    this.state,
                    ReaderState::InStatement | ReaderState::BetweenResults
                )
            {
                this.conn.note_sync_pending();
                this.state = ReaderState::Errored;
                return Poll::Ready(Some(Err(ErrorKind::Timeout(TimeoutKind::Command).into())));
            }
        }

        match ready!(this.poll_read(cx)) {
            Ok(Some(row)) => Poll::Ready(Some(Ok(row))),
            Ok(None) => Poll::Ready(None),
            Err(err) => Poll::Ready(Some(Err(err))),
        }
    }
}

impl std::fmt::Debug for DataReader<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataReader")
            .field("statement", &self.cur)
            .field("state", &self.state)
            .finish()
    }
}

//! Statements, parameters and their execution results.
use std::sync::{Arc, atomic::{AtomicU16, Ordering}};

use crate::{
    column::FieldDescription,
    common::ByteStr,
    encode::{Encode, Encoded},
    postgres::Oid,
};

/// One SQL statement with positional input parameters.
///
/// Placeholders are positional only (`$1`, `$2`, ...); rewriting named
/// parameters into positional form is a preprocessor concern of the caller.
/// Execution results are attached on completion and readable through
/// [`Statement::outcome`] and [`Statement::columns`].
#[derive(Debug)]
pub struct Statement<'q> {
    sql: &'q str,
    params: Vec<Parameter<'q>>,
    max_rows: i32,
    pub(crate) columns: Option<Arc<[FieldDescription]>>,
    pub(crate) outcome: Option<Outcome>,
    pub(crate) prepared: Option<Prepared>,
}

impl<'q> Statement<'q> {
    pub fn new(sql: &'q str) -> Self {
        Self {
            sql,
            params: Vec::new(),
            max_rows: 0,
            columns: None,
            outcome: None,
            prepared: None,
        }
    }

    /// Bind the next positional input parameter.
    pub fn bind<E: Encode<'q>>(mut self, value: E) -> Self {
        self.params.push(Parameter::input(value));
        self
    }

    /// Bind a parameter with an explicit direction or name.
    pub fn bind_param(mut self, param: Parameter<'q>) -> Self {
        self.params.push(param);
        self
    }

    /// Cap the number of rows Execute returns; zero means no limit.
    ///
    /// A capped execution that hits the limit finishes with
    /// [`Outcome::suspended`] set.
    pub fn max_rows(mut self, max_rows: i32) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn sql(&self) -> &'q str {
        self.sql
    }

    pub fn params(&self) -> &[Parameter<'q>] {
        &self.params
    }

    pub(crate) fn max_rows_hint(&self) -> i32 {
        self.max_rows
    }

    /// Column metadata of the statement's result set, when it has one.
    pub fn columns(&self) -> Option<&Arc<[FieldDescription]>> {
        self.columns.as_ref()
    }

    /// Execution result, present once the statement completed.
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Rows affected or returned; zero before completion.
    pub fn rows_affected(&self) -> u64 {
        self.outcome.as_ref().map(|o| o.rows).unwrap_or(0)
    }

    /// Whether a server-side prepared statement backs this statement.
    pub fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }

    /// Server-assigned name of the prepared statement.
    pub fn prepared_name(&self) -> Option<&str> {
        self.prepared.as_ref().map(|p| p.name.as_str())
    }

    /// Parameter type OIDs captured when the statement was described.
    pub fn param_oids(&self) -> Option<&[Oid]> {
        self.prepared.as_ref().map(|p| p.param_oids.as_slice())
    }
}

impl Clone for Statement<'_> {
    /// Deep copy of SQL and parameter values.
    ///
    /// Execution state (results, prepared name) does not carry over.
    fn clone(&self) -> Self {
        Self {
            sql: self.sql,
            params: self.params.iter().map(Parameter::to_owned_param).collect(),
            max_rows: self.max_rows,
            columns: None,
            outcome: None,
            prepared: None,
        }
    }
}

/// Direction of a statement parameter.
///
/// The wire protocol only carries input parameters; anything else is
/// rejected before a single byte is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDirection {
    Input,
    Output,
    InputOutput,
}

/// A statement parameter: a value, a direction and an optional name.
///
/// The name is only meaningful to name-rewriting preprocessors; the core
/// binds by position.
#[derive(Debug)]
pub struct Parameter<'q> {
    pub value: Encoded<'q>,
    pub direction: ParamDirection,
    pub name: Option<ByteStr>,
}

impl<'q> Parameter<'q> {
    pub fn input<E: Encode<'q>>(value: E) -> Self {
        Self {
            value: value.encode(),
            direction: ParamDirection::Input,
            name: None,
        }
    }

    pub fn with_direction(mut self, direction: ParamDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(ByteStr::copy_from_str(name));
        self
    }

    fn to_owned_param(&self) -> Parameter<'q> {
        Parameter {
            value: self.value.to_owned(),
            direction: self.direction,
            name: self.name.clone(),
        }
    }
}

impl crate::encode::BindValue for Parameter<'_> {
    fn wire_len(&self) -> i32 {
        self.value.wire_len()
    }

    fn as_slice(&self) -> &[u8] {
        self.value.as_slice()
    }
}

/// What kind of SQL command a statement turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Fetch,
    Move,
    Copy,
    /// DDL and everything else without a row count in its tag.
    Other,
    /// An empty query string.
    Empty,
}

/// Completion data parsed from the CommandComplete tag.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub statement_type: StatementType,
    /// Rows affected or retrieved.
    pub rows: u64,
    /// Zero unless a single-row INSERT into an OID-carrying table; modern
    /// servers always report zero.
    pub oid: u32,
    /// The Execute row limit was reached and the portal suspended.
    pub suspended: bool,
}

impl Outcome {
    pub(crate) fn empty() -> Self {
        Self { statement_type: StatementType::Empty, rows: 0, oid: 0, suspended: false }
    }

    pub(crate) fn suspended() -> Self {
        Self { statement_type: StatementType::Select, rows: 0, oid: 0, suspended: true }
    }

    /// Parse a command tag such as `INSERT 0 1` or `SELECT 42`.
    ///
    /// For INSERT the tag is `INSERT oid rows`; for SELECT, UPDATE, DELETE,
    /// MERGE, FETCH, MOVE and COPY the row count is the last word. Tags
    /// without a count (`BEGIN`, `SET`, ...) yield zero rows.
    pub(crate) fn from_tag(tag: &str) -> Self {
        let mut words = tag.split_whitespace();

        let statement_type = match words.next() {
            Some("SELECT") => StatementType::Select,
            Some("INSERT") => StatementType::Insert,
            Some("UPDATE") => StatementType::Update,
            Some("DELETE") => StatementType::Delete,
            Some("MERGE") => StatementType::Merge,
            Some("FETCH") => StatementType::Fetch,
            Some("MOVE") => StatementType::Move,
            Some("COPY") => StatementType::Copy,
            _ => StatementType::Other,
        };

        let (oid, rows) = match statement_type {
            StatementType::Insert => {
                let oid = words.next().and_then(|w| w.parse().ok()).unwrap_or(0);
                let rows = words.next().and_then(|w| w.parse().ok()).unwrap_or(0);
                (oid, rows)
            }
            StatementType::Other => (0, 0),
            _ => (0, words.next().and_then(|w| w.parse().ok()).unwrap_or(0)),
        };

        Self { statement_type, rows, oid, suspended: false }
    }
}

/// Server-side prepared statement state.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub name: ByteStr,
    pub param_oids: Vec<Oid>,
    pub columns: Option<Arc<[FieldDescription]>>,
}

/// A short inline name, either empty (the unnamed statement or portal) or
/// a prefix letter plus a process-wide counter.
#[derive(Clone, PartialEq, Eq)]
pub struct Name {
    buf: [u8; 8],
    len: u8,
}

impl Name {
    fn unnamed() -> Self {
        Self { buf: [0; 8], len: 0 }
    }

    fn generate(prefix: u8, counter: &AtomicU16) -> Self {
        let id = counter.fetch_add(1, Ordering::Relaxed);
        let mut buf = [0u8; 8];
        buf[0] = prefix;
        let mut digits = itoa::Buffer::new();
        let digits = digits.format(id).as_bytes();
        buf[1..1 + digits.len()].copy_from_slice(digits);
        Self { buf, len: 1 + digits.len() as u8 }
    }

    pub fn as_str(&self) -> &str {
        // only ASCII is ever written
        unsafe { std::str::from_utf8_unchecked(&self.buf[..self.len as usize]) }
    }

    pub fn is_unnamed(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Name").field(&self.as_str()).finish()
    }
}

macro_rules! name_kind {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name(Name);

        impl $name {
            #[allow(unused)]
            pub(crate) fn unnamed() -> Self {
                Self(Name::unnamed())
            }

            #[allow(unused)]
            pub(crate) fn next() -> Self {
                static ID: AtomicU16 = AtomicU16::new(0);
                Self(Name::generate($prefix, &ID))
            }
        }

        impl std::ops::Deref for $name {
            type Target = Name;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.as_str()).finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

name_kind! {
    /// Server-side identifier of a parsed statement.
    StatementName, b's'
}

name_kind! {
    /// Server-side identifier of a bound portal.
    PortalName, b'c'
}

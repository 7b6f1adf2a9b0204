//! Process-wide pool registry.
//!
//! Pools are keyed by the verbatim connection-string value: two callers
//! using the same string share one pool, two strings that differ only in
//! formatting do not.
use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
};

use super::Pool;
use crate::{Config, Result};

static POOLS: OnceLock<Mutex<HashMap<String, Pool>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Pool>> {
    POOLS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get the shared pool for a connection string, creating it on first use.
///
/// Configurations with `Pooling=false` are rejected; open a dedicated
/// connector with [`crate::pool::connect`] instead.
pub fn pool_for(conn_str: &str) -> Result<Pool> {
    let mut pools = registry().lock().unwrap();
    if let Some(pool) = pools.get(conn_str) {
        return Ok(pool.clone());
    }

    let config = Config::parse(conn_str)?;
    if !config.pooling {
        return Err(crate::Error::invalid_op(
            "pooling is disabled for this connection string",
        ));
    }

    let pool = Pool::new(config)?;
    pools.insert(conn_str.to_owned(), pool.clone());
    Ok(pool)
}

/// Drop the registered pool for a connection string, if any.
///
/// Outstanding connections keep working; new acquirers get a fresh pool.
pub fn evict(conn_str: &str) {
    if let Some(pools) = POOLS.get() {
        pools.lock().unwrap().remove(conn_str);
    }
}

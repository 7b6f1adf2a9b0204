//! Pool sizing, reuse and timeout behavior against the mock backend.
mod support;

use std::time::Duration;

use postgate::{ErrorKind, Pool, Statement, TimeoutKind, pool::manager};
use support::MockServer;

#[tokio::test(flavor = "multi_thread")]
async fn lifo_reuse_returns_the_same_backend() {
    let server = MockServer::spawn().await;
    let pool = Pool::connect(&server.conn_str("MaxPoolSize=5")).unwrap();

    let conn = pool.acquire().await.unwrap();
    let pid = conn.backend_process_id();
    conn.release().await.unwrap();

    assert_eq!(pool.idle_count(), 1);
    assert_eq!(pool.busy_count(), 0);

    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.backend_process_id(), pid, "hot connector was not reused");
    conn.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn saturated_pool_hands_off_to_the_waiter() {
    let server = MockServer::spawn().await;
    let pool = Pool::connect(&server.conn_str("MaxPoolSize=1;Timeout=0")).unwrap();

    let first = pool.acquire().await.unwrap();
    let pid = first.backend_process_id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            let pid = conn.backend_process_id();
            conn.release().await.unwrap();
            pid
        })
    };

    // the waiter must be parked, not failed
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());
    assert_eq!(pool.busy_count(), 1);

    first.release().await.unwrap();

    // the released connector is handed over, not a fresh one
    assert_eq!(waiter.await.unwrap(), pid);
    assert!(pool.busy_count() + pool.idle_count() <= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn acquire_times_out_and_recovers() {
    let server = MockServer::spawn().await;
    let pool = Pool::connect(&server.conn_str("MaxPoolSize=1;Timeout=1")).unwrap();

    let held = pool.acquire().await.unwrap();

    let started = std::time::Instant::now();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::Timeout(TimeoutKind::PoolAcquire)
    ));
    assert!(started.elapsed() >= Duration::from_millis(900));

    held.release().await.unwrap();

    // a timed-out waiter does not poison the pool
    let conn = pool.acquire().await.unwrap();
    conn.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn try_acquire_fails_fast_at_capacity() {
    let server = MockServer::spawn().await;
    let pool = Pool::connect(&server.conn_str("MaxPoolSize=1")).unwrap();

    let held = pool.acquire().await.unwrap();
    let err = pool.try_acquire().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::PoolExhausted));
    held.release().await.unwrap();

    assert!(pool.try_acquire().is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn release_resets_the_session() {
    let server = MockServer::spawn().await;
    let pool = Pool::connect(&server.conn_str("MaxPoolSize=2")).unwrap();

    let conn = pool.acquire().await.unwrap();
    conn.release().await.unwrap();
    assert_eq!(server.discard_count(), 1, "DISCARD ALL not issued on release");

    let conn = pool.acquire().await.unwrap();
    conn.release().await.unwrap();
    assert_eq!(server.discard_count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn no_reset_on_close_skips_the_discard() {
    let server = MockServer::spawn().await;
    let pool = Pool::connect(&server.conn_str("MaxPoolSize=2;NoResetOnClose=true")).unwrap();

    let conn = pool.acquire().await.unwrap();
    conn.release().await.unwrap();
    assert_eq!(server.discard_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn min_pool_size_fills_in_the_background() {
    let server = MockServer::spawn().await;
    let pool = Pool::connect(&server.conn_str("MinPoolSize=3;MaxPoolSize=5")).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if pool.idle_count() + pool.busy_count() >= 3 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "min fill never happened");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_churn_preserves_the_size_invariant() {
    const MAX: usize = 4;

    let server = MockServer::spawn().await;
    let pool = Pool::connect(&server.conn_str("MaxPoolSize=4;Timeout=10")).unwrap();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let mut conn = pool.acquire().await.unwrap();
            let mut stmts = [Statement::new("SELECT $1").bind(i as i32)];
            let mut reader = conn.execute(&mut stmts).await.unwrap();
            let row = reader.read().await.unwrap().expect("one row");
            assert_eq!(row.try_get::<_, i32>(0).unwrap(), i as i32);
            reader.close().await.unwrap();
            drop(reader);
            conn.release().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(pool.busy_count(), 0);
    assert!(pool.idle_count() <= MAX);
}

#[tokio::test(flavor = "multi_thread")]
async fn manager_shares_pools_by_connection_string() {
    let server = MockServer::spawn().await;
    let conn_str = server.conn_str("MaxPoolSize=2");

    let a = manager::pool_for(&conn_str).unwrap();
    let b = manager::pool_for(&conn_str).unwrap();

    let conn = a.acquire().await.unwrap();
    conn.release().await.unwrap();
    assert_eq!(b.idle_count(), 1, "pools for the same string are shared");

    manager::evict(&conn_str);
}

#[tokio::test(flavor = "multi_thread")]
async fn search_path_does_not_leak_across_borrowers() {
    let server = MockServer::spawn().await;
    let pool = Pool::connect(&server.conn_str("MaxPoolSize=1")).unwrap();

    let mut conn = pool.acquire().await.unwrap();
    let mut stmts = [Statement::new("SET search_path = pg_temp")];
    let mut reader = conn.execute(&mut stmts).await.unwrap();
    reader.close().await.unwrap();
    drop(reader);
    conn.release().await.unwrap();

    // the reset between borrowers is exactly one DISCARD ALL
    assert_eq!(server.discard_count(), 1);
}

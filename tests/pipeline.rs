//! Extended-query pipeline behavior against the mock backend.
mod support;

use std::sync::{Arc, Mutex};

use postgate::{ErrorKind, ParamDirection, Parameter, Statement, StatementType, connect};
use support::MockServer;

#[tokio::test]
async fn single_literal_select() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server.conn_str("")).await.unwrap();

    let mut stmts = [Statement::new("SELECT 8")];
    let mut reader = conn.execute(&mut stmts).await.unwrap();

    let row = reader.read().await.unwrap().expect("one row");
    let n: i32 = row.try_get(0).unwrap();
    assert_eq!(n, 8);

    assert!(reader.read().await.unwrap().is_none());
    assert!(!reader.next_result().await.unwrap());
    drop(reader);

    let outcome = stmts[0].outcome().expect("statement completed");
    assert_eq!(outcome.statement_type, StatementType::Select);
    assert_eq!(outcome.rows, 1);
    assert_eq!(outcome.oid, 0);

    conn.close().await.unwrap();
}

#[tokio::test]
async fn single_positional_parameter() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server.conn_str("")).await.unwrap();

    let mut stmts = [Statement::new("SELECT $1").bind(8)];
    let mut reader = conn.execute(&mut stmts).await.unwrap();

    let row = reader.read().await.unwrap().expect("one row");
    assert_eq!(row.try_get::<_, i32>(0).unwrap(), 8);
    assert!(!reader.next_result().await.unwrap());
}

#[tokio::test]
async fn two_statement_pipeline() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server.conn_str("")).await.unwrap();

    let mut stmts = [
        Statement::new("SELECT $1").bind(8),
        Statement::new("SELECT $1").bind(9),
    ];
    let mut reader = conn.execute(&mut stmts).await.unwrap();

    let row = reader.read().await.unwrap().expect("first result row");
    assert_eq!(row.try_get::<_, i32>(0).unwrap(), 8);

    assert!(reader.next_result().await.unwrap());

    let row = reader.read().await.unwrap().expect("second result row");
    assert_eq!(row.try_get::<_, i32>(0).unwrap(), 9);

    assert!(!reader.next_result().await.unwrap());
}

/// A thousand statements overflow the fixed write buffer many times over,
/// so this covers the mid-pipeline flush path and result-boundary
/// crossings in one go.
#[tokio::test]
async fn thousand_statement_pipeline() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server.conn_str("")).await.unwrap();

    let mut stmts: Vec<Statement> = (0..1000)
        .map(|_| Statement::new("SELECT $1").bind(8))
        .collect();
    let mut reader = conn.execute(&mut stmts).await.unwrap();

    let mut sum: i64 = 0;
    loop {
        while let Some(row) = reader.read().await.unwrap() {
            sum += row.try_get::<_, i32>(0).unwrap() as i64;
        }
        if !reader.next_result().await.unwrap() {
            break;
        }
    }
    assert_eq!(sum, 8000);
}

#[tokio::test]
async fn output_parameter_rejected_before_any_byte() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server.conn_str("")).await.unwrap();

    let mut stmts = [Statement::new("SELECT $1")
        .bind_param(Parameter::input(8).with_direction(ParamDirection::Output))];
    let err = conn.execute(&mut stmts).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidOperation(_)));

    // nothing was sent: the connection works as if untouched
    let mut stmts = [Statement::new("SELECT 5")];
    let mut reader = conn.execute(&mut stmts).await.unwrap();
    let row = reader.read().await.unwrap().expect("one row");
    assert_eq!(row.try_get::<_, i32>(0).unwrap(), 5);
}

#[tokio::test]
async fn server_error_leaves_connection_usable() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server.conn_str("")).await.unwrap();

    let mut stmts = [
        Statement::new("SELECT error").bind(1),
        Statement::new("SELECT $1").bind(2),
    ];
    let mut reader = conn.execute(&mut stmts).await.unwrap();
    let err = reader.read().await.unwrap_err();
    let db = err.as_server_error().expect("server error");
    assert_eq!(db.sqlstate(), "42601");
    drop(reader);

    // the error was fenced by Sync; the next pipeline runs normally
    let mut stmts = [Statement::new("SELECT 7")];
    let mut reader = conn.execute(&mut stmts).await.unwrap();
    let row = reader.read().await.unwrap().expect("one row");
    assert_eq!(row.try_get::<_, i32>(0).unwrap(), 7);
}

#[tokio::test]
async fn empty_query_completes_with_empty_outcome() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server.conn_str("")).await.unwrap();

    let mut stmts = [Statement::new("")];
    let mut reader = conn.execute(&mut stmts).await.unwrap();
    assert!(reader.read().await.unwrap().is_none());
    assert!(!reader.next_result().await.unwrap());
    drop(reader);

    assert_eq!(
        stmts[0].outcome().unwrap().statement_type,
        StatementType::Empty,
    );
}

#[tokio::test]
async fn prepared_statement_round_trips() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server.conn_str("")).await.unwrap();

    let mut stmt = Statement::new("SELECT $1").bind(3);
    conn.prepare(&mut stmt, None).await.unwrap();
    assert!(stmt.is_prepared());
    assert_eq!(stmt.param_oids(), Some(&[23u32][..]));
    assert!(stmt.columns().is_some());

    for _ in 0..2 {
        let mut reader = conn.execute(std::slice::from_mut(&mut stmt)).await.unwrap();
        let row = reader.read().await.unwrap().expect("one row");
        assert_eq!(row.try_get::<_, i32>(0).unwrap(), 3);
        assert!(!reader.next_result().await.unwrap());
    }

    conn.unprepare(&mut stmt).await.unwrap();
    assert!(!stmt.is_prepared());
}

#[tokio::test]
async fn notices_reach_the_listener_without_interrupting_rows() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server.conn_str("")).await.unwrap();

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    conn.set_notice_handler(Box::new(move |notice| {
        sink.lock().unwrap().push(notice.message().to_owned());
    }));

    let mut stmts = [Statement::new("SELECT 4 /*notice*/")];
    let mut reader = conn.execute(&mut stmts).await.unwrap();
    let row = reader.read().await.unwrap().expect("one row");
    assert_eq!(row.try_get::<_, i32>(0).unwrap(), 4);
    assert!(!reader.next_result().await.unwrap());
    drop(reader);

    assert_eq!(seen.lock().unwrap().as_slice(), ["this is fine"]);
}

#[tokio::test]
async fn dropping_a_reader_mid_result_drains_lazily() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server.conn_str("")).await.unwrap();

    let mut stmts = [
        Statement::new("SELECT $1").bind(1),
        Statement::new("SELECT $1").bind(2),
    ];
    let reader = conn.execute(&mut stmts).await.unwrap();
    drop(reader); // nothing consumed

    let mut stmts = [Statement::new("SELECT 6")];
    let mut reader = conn.execute(&mut stmts).await.unwrap();
    let row = reader.read().await.unwrap().expect("one row");
    assert_eq!(row.try_get::<_, i32>(0).unwrap(), 6);
}

#[tokio::test]
async fn cleartext_password_handshake() {
    let server = support::MockServer::spawn_with(support::MockOptions {
        require_password: true,
    })
    .await;

    let mut conn = connect(&server.conn_str("")).await.unwrap();
    assert_eq!(conn.parameter_status("server_version"), Some("16.3"));
    conn.close().await.unwrap();
}

#[tokio::test]
async fn row_stream_yields_rows() {
    use futures_core::Stream;
    use std::pin::Pin;

    let server = MockServer::spawn().await;
    let mut conn = connect(&server.conn_str("")).await.unwrap();

    let mut stmts = [Statement::new("SELECT 9")];
    let mut reader = conn.execute(&mut stmts).await.unwrap();

    let row = std::future::poll_fn(|cx| Pin::new(&mut reader).poll_next(cx))
        .await
        .expect("one row")
        .unwrap();
    assert_eq!(row.try_get::<_, i32>(0).unwrap(), 9);

    assert!(
        std::future::poll_fn(|cx| Pin::new(&mut reader).poll_next(cx))
            .await
            .is_none()
    );
}

#[tokio::test]
async fn dynamic_value_decoding_by_oid() {
    use postgate::PgValue;

    let server = MockServer::spawn().await;
    let mut conn = connect(&server.conn_str("")).await.unwrap();

    let mut stmts = [Statement::new("SELECT 11")];
    let mut reader = conn.execute(&mut stmts).await.unwrap();
    let row = reader.read().await.unwrap().expect("one row");
    assert_eq!(row.try_value(0).unwrap(), PgValue::Int4(11));
}

/// A column whose type OID has no registered handler must be requested in
/// text format, so the fallback handler really does see the text
/// representation rather than an opaque binary encoding.
#[tokio::test]
async fn unregistered_oid_falls_back_to_text() {
    use postgate::PgValue;

    let server = MockServer::spawn().await;
    let mut conn = connect(&server.conn_str("")).await.unwrap();

    let mut stmts = [Statement::new("SELECT unknown_type")];
    let mut reader = conn.execute(&mut stmts).await.unwrap();
    let row = reader.read().await.unwrap().expect("one row");
    assert_eq!(row.try_value(0).unwrap(), PgValue::Text("(1,2)".into()));
    assert!(!reader.next_result().await.unwrap());
    drop(reader);

    // the same holds after the statement is described and cached
    let mut stmt = Statement::new("SELECT unknown_type");
    conn.prepare(&mut stmt, None).await.unwrap();
    let mut reader = conn.execute(std::slice::from_mut(&mut stmt)).await.unwrap();
    let row = reader.read().await.unwrap().expect("one row");
    assert_eq!(row.try_value(0).unwrap(), PgValue::Text("(1,2)".into()));
}

/// Result formats are negotiated per column: a described int4 column is
/// fetched in binary, an undescribed statement in text. Either way the
/// typed getter sees the value.
#[tokio::test]
async fn result_formats_follow_the_description() {
    use postgate::postgres::PgFormat;

    let server = MockServer::spawn().await;
    let mut conn = connect(&server.conn_str("")).await.unwrap();

    // first flight: not yet described, fetched as text
    let mut stmts = [Statement::new("SELECT 21")];
    let mut reader = conn.execute(&mut stmts).await.unwrap();
    let row = reader.read().await.unwrap().expect("one row");
    assert_eq!(row.columns()[0].format_code, PgFormat::Text.format_code());
    assert_eq!(row.try_get::<_, i32>(0).unwrap(), 21);
    assert!(!reader.next_result().await.unwrap());
    drop(reader);

    // prepared: the description negotiates binary for int4
    let mut stmt = Statement::new("SELECT 22");
    conn.prepare(&mut stmt, None).await.unwrap();
    let mut reader = conn.execute(std::slice::from_mut(&mut stmt)).await.unwrap();
    let row = reader.read().await.unwrap().expect("one row");
    assert_eq!(row.columns()[0].format_code, PgFormat::Binary.format_code());
    assert_eq!(row.try_get::<_, i32>(0).unwrap(), 22);
}

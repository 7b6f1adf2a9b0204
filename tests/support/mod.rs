//! An in-process backend speaking enough of the v3 protocol to exercise
//! startup, the extended-query pipeline and the pool without a server.
//!
//! Statements of the shape `SELECT <n>` return one int4 row with that
//! literal; `SELECT $1` echoes the first bound parameter. The row value is
//! encoded in whatever result format the Bind message requested. A
//! statement containing `unknown_type` describes its column with an OID no
//! client handler covers and returns a text payload; one containing
//! `error` fails with a server error; one containing `notice` emits a
//! NoticeResponse before its row. `DISCARD ALL` is counted so tests can
//! observe pool resets.
#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicI32, AtomicUsize, Ordering},
};

use bytes::{Buf, BufMut, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

pub struct MockServer {
    port: u16,
    pub discards: Arc<AtomicUsize>,
    pub connections: Arc<AtomicI32>,
}

#[derive(Default, Clone)]
pub struct MockOptions {
    /// Demand a cleartext password during startup.
    pub require_password: bool,
}

impl MockServer {
    pub async fn spawn() -> MockServer {
        Self::spawn_with(MockOptions::default()).await
    }

    pub async fn spawn_with(options: MockOptions) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let discards = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(AtomicI32::new(0));

        let server = MockServer {
            port,
            discards: discards.clone(),
            connections: connections.clone(),
        };

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let discards = discards.clone();
                let connections = connections.clone();
                let options = options.clone();
                tokio::spawn(async move {
                    let _ = session(stream, options, discards, connections).await;
                });
            }
        });

        server
    }

    pub fn conn_str(&self, extra: &str) -> String {
        let mut s = format!(
            "Host=127.0.0.1;Port={};Username=test;Password=pw;Database=mock",
            self.port,
        );
        if !extra.is_empty() {
            s.push(';');
            s.push_str(extra);
        }
        s
    }

    pub fn discard_count(&self) -> usize {
        self.discards.load(Ordering::SeqCst)
    }
}

struct Session {
    stream: TcpStream,
    out: BytesMut,
    /// statement name -> sql
    statements: Vec<(String, String)>,
    /// sql, first bound parameter and requested result format of the portal
    bound: Option<(String, Option<Vec<u8>>, bool)>,
    /// server discards until Sync after an error
    failed: bool,
    discards: Arc<AtomicUsize>,
}

async fn session(
    stream: TcpStream,
    options: MockOptions,
    discards: Arc<AtomicUsize>,
    connections: Arc<AtomicI32>,
) -> std::io::Result<()> {
    let mut s = Session {
        stream,
        out: BytesMut::new(),
        statements: Vec::new(),
        bound: None,
        failed: false,
        discards,
    };

    // startup or cancel-request frame: no type byte
    let len = s.stream.read_i32().await?;
    let mut body = vec![0u8; len as usize - 4];
    s.stream.read_exact(&mut body).await?;
    let mut body = BytesMut::from(&body[..]);
    let code = body.get_i32();
    if code == 80877102 {
        // cancel request: nothing to answer
        return Ok(());
    }
    assert_eq!(code, 196608, "protocol version");

    if options.require_password {
        frame(&mut s.out, b'R', |b| b.put_i32(3));
        s.flush().await?;
        let (t, _) = s.read_frame().await?;
        assert_eq!(t, b'p', "expected a password message");
    }

    let pid = connections.fetch_add(1, Ordering::SeqCst) + 1;

    frame(&mut s.out, b'R', |b| b.put_i32(0));
    frame(&mut s.out, b'S', |b| {
        put_cstr(b, "server_version");
        put_cstr(b, "16.3");
    });
    frame(&mut s.out, b'K', |b| {
        b.put_i32(pid);
        b.put_i32(0x5ecce7);
    });
    frame(&mut s.out, b'Z', |b| b.put_u8(b'I'));
    s.flush().await?;

    loop {
        let (msgtype, mut body) = match s.read_frame().await {
            Ok(frame) => frame,
            Err(_) => return Ok(()),
        };

        if s.failed && !matches!(msgtype, b'S' | b'X' | b'Q') {
            continue;
        }

        match msgtype {
            b'P' => {
                let name = get_cstr(&mut body);
                let sql = get_cstr(&mut body);
                s.statements.retain(|(n, _)| *n != name);
                s.statements.push((name, sql));
                frame(&mut s.out, b'1', |_| {});
            }
            b'D' => {
                let _kind = body.get_u8();
                let name = get_cstr(&mut body);
                let sql = s.sql_of(&name);
                let nparams = sql.matches('$').count() as i16;
                frame(&mut s.out, b't', |b| {
                    b.put_i16(nparams);
                    for _ in 0..nparams {
                        b.put_u32(23);
                    }
                });
                if sql.trim().is_empty() || !sql.starts_with("SELECT") {
                    frame(&mut s.out, b'n', |_| {});
                } else {
                    // `point` for the unregistered-type statements, int4
                    // otherwise
                    let (oid, typlen) = match sql.contains("unknown_type") {
                        true => (600u32, 16i16),
                        false => (23u32, 4i16),
                    };
                    frame(&mut s.out, b'T', |b| {
                        b.put_i16(1);
                        put_cstr(b, "col");
                        b.put_u32(0);
                        b.put_i16(0);
                        b.put_u32(oid);
                        b.put_i16(typlen);
                        b.put_i32(-1);
                        // the statement variant of Describe reports the
                        // format as not yet known
                        b.put_i16(0);
                    });
                }
            }
            b'B' => {
                let _portal = get_cstr(&mut body);
                let name = get_cstr(&mut body);
                let nfmt = body.get_i16();
                for _ in 0..nfmt {
                    body.get_i16();
                }
                let nparams = body.get_i16();
                let mut first = None;
                for i in 0..nparams {
                    let len = body.get_i32();
                    if len >= 0 {
                        let value = body.split_to(len as usize).to_vec();
                        if i == 0 {
                            first = Some(value);
                        }
                    }
                }
                // zero result format codes means all-text
                let nres = body.get_i16();
                let mut binary = false;
                for i in 0..nres {
                    let code = body.get_i16();
                    if i == 0 {
                        binary = code == 1;
                    }
                }
                s.bound = Some((s.sql_of(&name), first, binary));
                frame(&mut s.out, b'2', |_| {});
            }
            b'E' => {
                let (sql, param, binary) = s.bound.clone().unwrap_or_default();
                s.execute(&sql, param, binary);
            }
            b'C' => {
                let _kind = body.get_u8();
                let name = get_cstr(&mut body);
                s.statements.retain(|(n, _)| *n != name);
                frame(&mut s.out, b'3', |_| {});
            }
            b'S' => {
                s.failed = false;
                frame(&mut s.out, b'Z', |b| b.put_u8(b'I'));
                s.flush().await?;
            }
            b'H' => s.flush().await?,
            b'Q' => {
                let sql = get_cstr(&mut body);
                if sql == "DISCARD ALL" {
                    s.discards.fetch_add(1, Ordering::SeqCst);
                    s.statements.clear();
                }
                s.failed = false;
                frame(&mut s.out, b'C', |b| put_cstr(b, &sql));
                frame(&mut s.out, b'Z', |b| b.put_u8(b'I'));
                s.flush().await?;
            }
            b'X' => return Ok(()),
            other => panic!("mock backend got unexpected message {:?}", other as char),
        }
    }
}

impl Session {
    fn sql_of(&self, name: &str) -> String {
        self.statements
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, sql)| sql.clone())
            .unwrap_or_default()
    }

    /// Answer an Execute for `sql` with this server's canned semantics.
    fn execute(&mut self, sql: &str, param: Option<Vec<u8>>, binary: bool) {
        if sql.trim().is_empty() {
            frame(&mut self.out, b'I', |_| {});
            return;
        }

        if sql.contains("error") {
            self.failed = true;
            frame(&mut self.out, b'E', |b| {
                for (code, value) in [
                    (b'S', "ERROR"),
                    (b'V', "ERROR"),
                    (b'C', "42601"),
                    (b'M', "syntax error at or near \"error\""),
                ] {
                    b.put_u8(code);
                    put_cstr(b, value);
                }
                b.put_u8(0);
            });
            return;
        }

        if !sql.starts_with("SELECT") {
            let tag = sql.split_whitespace().next().unwrap_or("OK").to_uppercase();
            frame(&mut self.out, b'C', |b| put_cstr(b, &tag));
            return;
        }

        if sql.contains("unknown_type") {
            // a point value, only meaningful in its text representation
            frame(&mut self.out, b'D', |b| {
                b.put_i16(1);
                b.put_i32(5);
                b.put_slice(b"(1,2)");
            });
            frame(&mut self.out, b'C', |b| put_cstr(b, "SELECT 1"));
            return;
        }

        if sql.contains("notice") {
            frame(&mut self.out, b'N', |b| {
                for (code, value) in [
                    (b'S', "NOTICE"),
                    (b'V', "NOTICE"),
                    (b'C', "00000"),
                    (b'M', "this is fine"),
                ] {
                    b.put_u8(code);
                    put_cstr(b, value);
                }
                b.put_u8(0);
            });
        }

        let value = match param {
            Some(raw) => {
                let mut raw = &raw[..];
                raw.get_i32()
            }
            None => sql
                .trim_start_matches("SELECT")
                .split_whitespace()
                .next()
                .and_then(|w| w.parse().ok())
                .unwrap_or(0),
        };

        frame(&mut self.out, b'D', |b| {
            b.put_i16(1);
            match binary {
                true => {
                    b.put_i32(4);
                    b.put_i32(value);
                }
                false => {
                    let text = value.to_string();
                    b.put_i32(text.len() as i32);
                    b.put_slice(text.as_bytes());
                }
            }
        });
        frame(&mut self.out, b'C', |b| put_cstr(b, "SELECT 1"));
    }

    async fn read_frame(&mut self) -> std::io::Result<(u8, BytesMut)> {
        let msgtype = self.stream.read_u8().await?;
        let len = self.stream.read_i32().await?;
        let mut body = vec![0u8; len as usize - 4];
        self.stream.read_exact(&mut body).await?;
        Ok((msgtype, BytesMut::from(&body[..])))
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        let out = self.out.split();
        self.stream.write_all(&out).await
    }
}

fn frame(out: &mut BytesMut, msgtype: u8, body: impl FnOnce(&mut BytesMut)) {
    out.put_u8(msgtype);
    let len_at = out.len();
    out.put_i32(0);
    body(out);
    let len = (out.len() - len_at) as i32;
    out[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(out: &mut BytesMut, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

fn get_cstr(body: &mut BytesMut) -> String {
    let end = body.iter().position(|b| *b == 0).expect("NUL");
    let s = String::from_utf8(body.split_to(end).to_vec()).unwrap();
    body.advance(1);
    s
}

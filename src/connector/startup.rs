//! The startup phase: handshake, authentication, session parameters.
//!
//! <https://www.postgresql.org/docs/17/protocol-flow.html#PROTOCOL-FLOW-START-UP>
use md5::{Digest, Md5};

use super::Connector;
use crate::{
    Result,
    error::ErrorKind,
    postgres::{
        ProtocolError,
        backend::{Authentication, BackendMessage},
        frontend,
    },
};

/// Drive the connection from an open socket to the first ReadyForQuery.
pub(super) async fn startup(conn: &mut Connector) -> Result<()> {
    let config = conn.config().clone();
    let params = config.startup_params();

    // To begin a session, a frontend opens a connection and sends a startup
    // message, optionally carrying additional run-time parameters.
    conn.send_startup(frontend::Startup {
        user: config.user.as_str(),
        database: config.database.as_deref(),
        params: &params,
    })
    .await?;
    conn.flush().await?;

    // The server replies with an authentication request the frontend
    // answers with a password message. For every method except GSSAPI,
    // SSPI and SASL there is at most one request and one response.
    loop {
        match conn.recv::<Authentication>().await? {
            Authentication::Ok => break,
            Authentication::CleartextPassword => {
                conn.put(frontend::PasswordMessage { password: config.password.as_str() })
                    .await?;
                conn.flush().await?;
            }
            Authentication::MD5Password { salt } => {
                let hashed = md5_password(&config.user, &config.password, salt);
                conn.put(frontend::PasswordMessage { password: &hashed }).await?;
                conn.flush().await?;
            }
            Authentication::KerberosV5
            | Authentication::Gss
            | Authentication::Sspi
            | Authentication::Sasl => return Err(ErrorKind::UnsupportedAuth.into()),
        }
    }

    // After AuthenticationOk a backend process is being started; the
    // frontend waits through ParameterStatus and BackendKeyData until the
    // first ReadyForQuery. ParameterStatus and notices are absorbed by the
    // receive path itself.
    loop {
        match conn.recv::<BackendMessage>().await? {
            BackendMessage::ReadyForQuery(rfq) => {
                conn.txn_status = rfq.status;
                break;
            }
            BackendMessage::BackendKeyData(key) => {
                conn.process_id = key.process_id;
                conn.secret_key = key.secret_key;
            }
            BackendMessage::NegotiateProtocolVersion(_negotiate) => {
                #[cfg(feature = "log")]
                log::warn!(
                    "server negotiated protocol minor version {}",
                    _negotiate.minor,
                );
            }
            other => {
                return Err(ProtocolError::unexpected_phase(other.msgtype(), "startup").into());
            }
        }
    }

    Ok(())
}

/// The MD5 scheme: `concat('md5', md5(md5(password + user) + salt))`.
fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let inner = hex(&hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{}", hex(&hasher.finalize()))
}

fn hex(digest: &[u8]) -> String {
    const TABLE: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push(TABLE[(b >> 4) as usize] as char);
        out.push(TABLE[(b & 0x0F) as usize] as char);
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn md5_response_matches_reference() {
        // psql sends this for user=foo password=bar salt=01020304
        let hashed = md5_password("foo", "bar", [1, 2, 3, 4]);
        assert!(hashed.starts_with("md5"));
        assert_eq!(hashed.len(), 3 + 32);
        // deterministic
        assert_eq!(hashed, md5_password("foo", "bar", [1, 2, 3, 4]));
        assert_ne!(hashed, md5_password("foo", "bar", [4, 3, 2, 1]));
    }
}

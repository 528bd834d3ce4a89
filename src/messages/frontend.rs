//! Construction of the messages the engine sends toward PostgreSQL.
//!
//! Frontend messages are framed by a 1 byte message code, followed by a
//! u32 integer delineating the length of the rest of the message. The
//! startup family (SSLRequest, StartupMessage) is untagged.
//!
//! For more information, see the official Postgres docs:
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::message::Message;
use crate::{APPLICATION_NAME, PROTOCOL_VERSION, SSL_REQUEST_CODE};

/// Longest accepted simple-query text, in bytes.
pub const MAX_QUERY_LENGTH: usize = 1024;

/// Seconds between the Unix epoch and 2000-01-01 00:00:00 UTC, the
/// PostgreSQL timestamp epoch.
const Y2000_EPOCH_SECS: i64 = 946_684_800;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

impl MessageCode {
    pub const COPY_DATA: Self = Self(b'd');
    pub const COPY_DONE: Self = Self(b'c');
    pub const COPY_FAIL: Self = Self(b'f');
    pub const PASSWORD_MESSAGE: Self = Self(b'p');
    pub const QUERY: Self = Self(b'Q');
    pub const SASL_RESPONSE: Self = Self(b'p');
    pub const TERMINATE: Self = Self(b'X');

    #[inline]
    pub fn frame(self, buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
        buf.put_u8(self.0);
        frame(buf, payload_fn);
    }
}

impl From<u8> for MessageCode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<MessageCode> for u8 {
    fn from(value: MessageCode) -> Self {
        value.0
    }
}

impl PartialEq<u8> for MessageCode {
    fn eq(&self, other: &u8) -> bool {
        self.0 == *other
    }
}

impl PartialEq<MessageCode> for u8 {
    fn eq(&self, other: &MessageCode) -> bool {
        *self == other.0
    }
}

/// Writes a length-prefixed frame body: reserves the 4-byte length field,
/// runs `payload_fn`, then patches the length (which includes the length
/// field itself).
#[inline]
pub fn frame(buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
    let base = buf.len();
    buf.put_u32(0);

    payload_fn(buf);

    let len = (buf.len() - base) as u32;
    buf[base..base + size_of::<u32>()].copy_from_slice(&len.to_be_bytes());
}

#[inline]
pub(crate) fn put_cstring(b: &mut impl BufMut, src: &[u8]) {
    b.put_slice(src);
    b.put_u8(0);
}

fn tagged(kind: MessageCode, payload_fn: impl FnOnce(&mut BytesMut)) -> Message {
    let mut buf = BytesMut::new();
    kind.frame(&mut buf, payload_fn);
    Message::from_parts(kind.into(), buf)
}

fn untagged(payload_fn: impl FnOnce(&mut BytesMut)) -> Message {
    let mut buf = BytesMut::new();
    frame(&mut buf, payload_fn);
    Message::from_parts(0, buf)
}

/// SSLRequest: untagged, `i32 length=8, i32 magic=80877103`.
pub fn ssl_request() -> Message {
    untagged(|b| {
        b.put_i32(SSL_REQUEST_CODE);
    })
}

/// StartupMessage: protocol 196608 followed by the NUL-terminated
/// parameter list `user`, `database`, `application_name=pgvictoria` and,
/// when requested, `replication=1`, closed by an extra NUL.
pub fn startup(username: &str, database: &str, replication: bool) -> Message {
    untagged(|b| {
        b.put_i32(PROTOCOL_VERSION);
        put_cstring(b, b"user");
        put_cstring(b, username.as_bytes());
        put_cstring(b, b"database");
        put_cstring(b, database.as_bytes());
        put_cstring(b, b"application_name");
        put_cstring(b, APPLICATION_NAME.as_bytes());
        if replication {
            put_cstring(b, b"replication");
            put_cstring(b, b"1");
        }
        b.put_u8(0);
    })
}

/// Cleartext password response.
pub fn auth_password(password: &str) -> Message {
    tagged(MessageCode::PASSWORD_MESSAGE, |b| {
        put_cstring(b, password.as_bytes());
    })
}

/// MD5 password response; `md5` is the precomputed `md5` + hex digest.
pub fn auth_md5(md5: &str) -> Message {
    tagged(MessageCode::PASSWORD_MESSAGE, |b| {
        put_cstring(b, md5.as_bytes());
    })
}

/// SASLInitialResponse for SCRAM-SHA-256: the mechanism name, a 4-byte
/// payload length, then the client-first blob ` n,,n=,r=` followed by the
/// client nonce. The nonce has no trailing NUL; the length field carries
/// it.
pub fn auth_scram256_initial(nonce: &str) -> Message {
    tagged(MessageCode::SASL_RESPONSE, |b| {
        put_cstring(b, b"SCRAM-SHA-256");
        b.put_u32((SCRAM_CLIENT_FIRST_PREFIX.len() + nonce.len()) as u32);
        b.put_slice(SCRAM_CLIENT_FIRST_PREFIX.as_bytes());
        b.put_slice(nonce.as_bytes());
    })
}

/// The literal prefix of the client-first blob, leading space included.
/// Peers compatible with this tool expect these exact bytes.
pub const SCRAM_CLIENT_FIRST_PREFIX: &str = " n,,n=,r=";

/// SASLResponse carrying the client-final message `<wp>,p=<proof>`,
/// where `wp` is the channel-binding-plus-nonce blob.
pub fn auth_scram256_proof(wp: &str, proof: &str) -> Message {
    tagged(MessageCode::SASL_RESPONSE, |b| {
        b.put_slice(wp.as_bytes());
        b.put_slice(b",p=");
        b.put_slice(proof.as_bytes());
    })
}

/// Simple query. Refuses oversize text rather than truncating.
pub fn query(sql: &str) -> Result<Message> {
    if sql.len() > MAX_QUERY_LENGTH {
        return Err(Error::Protocol(format!(
            "query exceeds {MAX_QUERY_LENGTH} bytes ({})",
            sql.len()
        )));
    }

    Ok(simple_query(sql))
}

fn simple_query(sql: &str) -> Message {
    tagged(MessageCode::QUERY, |b| {
        put_cstring(b, sql.as_bytes());
    })
}

pub fn identify_system() -> Message {
    simple_query("IDENTIFY_SYSTEM;")
}

pub fn timeline_history(timeline: i32) -> Message {
    simple_query(&format!("TIMELINE_HISTORY {timeline};"))
}

pub fn read_replication_slot(slot: &str) -> Message {
    simple_query(&format!("READ_REPLICATION_SLOT {slot};"))
}

/// START_REPLICATION, physical; `xlogpos` defaults to `0/0` and the slot
/// clause is omitted when no slot is given.
pub fn start_replication(xlogpos: Option<&str>, timeline: i32, slot: Option<&str>) -> Message {
    let xlogpos = match xlogpos {
        Some(pos) if !pos.is_empty() => pos,
        _ => "0/0",
    };

    let cmd = match slot {
        Some(slot) if !slot.is_empty() => {
            format!("START_REPLICATION SLOT {slot} PHYSICAL {xlogpos} TIMELINE {timeline};")
        }
        _ => format!("START_REPLICATION PHYSICAL {xlogpos} TIMELINE {timeline};"),
    };

    simple_query(&cmd)
}

/// Standby status update: `'r'`, the received/flushed/applied LSNs, the
/// current timestamp in microseconds since 2000-01-01 UTC and a trailing
/// reply-requested byte of `0`.
pub fn standby_status_update(received: i64, flushed: i64, applied: i64) -> Message {
    standby_status_update_at(received, flushed, applied, microseconds_since_y2000())
}

/// As [`standby_status_update`], with the clock supplied by the caller.
pub fn standby_status_update_at(received: i64, flushed: i64, applied: i64, now_us: i64) -> Message {
    tagged(MessageCode::COPY_DATA, |b| {
        b.put_u8(b'r');
        b.put_i64(received);
        b.put_i64(flushed);
        b.put_i64(applied);
        b.put_i64(now_us);
        b.put_u8(0);
    })
}

/// CopyData with an opaque payload.
pub fn copy_data(payload: &[u8]) -> Message {
    tagged(MessageCode::COPY_DATA, |b| {
        b.put_slice(payload);
    })
}

pub fn terminate() -> Message {
    tagged(MessageCode::TERMINATE, |_| {})
}

fn microseconds_since_y2000() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    now.as_micros() as i64 - Y2000_EPOCH_SECS * 1_000_000
}

//! Messages received from a PostgreSQL backend, and the ones the engine
//! emits when it answers clients in the backend role (authentication
//! challenges, connection refusal).
//!
//! See: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::messages::frontend::put_cstring;

/// Maximum allowed frame size from Postgres (1GiB).
///
/// This is an upper bound to prevent misbehaving servers from
/// allocating excessive memory or causing OOMs.
const MAX_FRAME_SIZE_BYTES: usize = 1 << 30;

/// Postgres backend messages are framed by a 1-byte message code,
/// followed by a u32 length for the rest of the message body.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

impl MessageCode {
    pub const AUTHENTICATION: Self = Self(b'R');
    pub const BACKEND_KEY_DATA: Self = Self(b'K');
    pub const COMMAND_COMPLETE: Self = Self(b'C');
    pub const COPY_BOTH_RESPONSE: Self = Self(b'W');
    pub const COPY_DATA: Self = Self(b'd');
    pub const COPY_DONE: Self = Self(b'c');
    pub const COPY_FAIL: Self = Self(b'f');
    pub const DATA_ROW: Self = Self(b'D');
    pub const EMPTY_QUERY_RESPONSE: Self = Self(b'I');
    pub const ERROR_RESPONSE: Self = Self(b'E');
    pub const NOTICE_RESPONSE: Self = Self(b'N');
    pub const PARAMETER_STATUS: Self = Self(b'S');
    pub const READY_FOR_QUERY: Self = Self(b'Z');
    pub const ROW_DESCRIPTION: Self = Self(b'T');
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

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            MessageCode::AUTHENTICATION => "Authentication",
            MessageCode::BACKEND_KEY_DATA => "BackendKeyData",
            MessageCode::COMMAND_COMPLETE => "CommandComplete",
            MessageCode::COPY_BOTH_RESPONSE => "CopyBothResponse",
            MessageCode::COPY_DATA => "CopyData",
            MessageCode::COPY_DONE => "CopyDone",
            MessageCode::COPY_FAIL => "CopyFail",
            MessageCode::DATA_ROW => "DataRow",
            MessageCode::EMPTY_QUERY_RESPONSE => "EmptyQueryResponse",
            MessageCode::ERROR_RESPONSE => "ErrorResponse",
            MessageCode::NOTICE_RESPONSE => "NoticeResponse",
            MessageCode::PARAMETER_STATUS => "ParameterStatus",
            MessageCode::READY_FOR_QUERY => "ReadyForQuery",
            MessageCode::ROW_DESCRIPTION => "RowDescription",
            _ => "Unknown",
        };
        write!(f, "{name}({})", self.0 as char)
    }
}

impl std::fmt::Debug for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageCode({})", self.0 as char)
    }
}

/// Reads exactly one tagged frame from the stream, returning it as a
/// [`Message`] holding the complete wire image.
pub async fn read_frame(mut stream: impl AsyncRead + Unpin) -> std::io::Result<Message> {
    let mut tag = [0; 1];
    stream.read_exact(&mut tag).await?;

    let mut len = [0; 4];
    stream.read_exact(&mut len).await?;
    let body_len = u32::from_be_bytes(len) as usize;

    if body_len < 4 || body_len > MAX_FRAME_SIZE_BYTES {
        let err_msg = format!("invalid frame size {body_len}");
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, err_msg));
    }

    let total = 1 + body_len;
    let mut data = BytesMut::with_capacity(total);
    data.put_u8(tag[0]);
    data.put_slice(&len);
    data.resize(total, 0);
    stream.read_exact(&mut data[5..]).await?;

    Ok(Message::from_parts(tag[0], data))
}

/// Longest accepted startup-family frame, matching the backend's own
/// bound on startup packets.
const MAX_STARTUP_FRAME_SIZE_BYTES: usize = 10000;

/// Reads one untagged startup-family frame (SSLRequest or
/// StartupMessage) from the stream.
pub async fn read_startup_frame(mut stream: impl AsyncRead + Unpin) -> std::io::Result<Message> {
    let mut len = [0; 4];
    stream.read_exact(&mut len).await?;
    let total = u32::from_be_bytes(len) as usize;

    if !(8..=MAX_STARTUP_FRAME_SIZE_BYTES).contains(&total) {
        let err_msg = format!("invalid startup frame size {total}");
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, err_msg));
    }

    let mut data = BytesMut::with_capacity(total);
    data.put_slice(&len);
    data.resize(total, 0);
    stream.read_exact(&mut data[4..]).await?;

    Ok(Message::from_parts(0, data))
}

/// The request identifier of an untagged startup-family frame: the first
/// i32 after the length field. Distinguishes SSLRequest (80877103) from
/// StartupMessage (196608).
pub fn request_id(msg: &Message) -> i32 {
    codec::read_i32(&msg.data()[4..])
}

/// RowDescription column count: the i16 at offset 5.
pub fn row_description_columns(msg: &Message) -> i16 {
    if msg.kind == MessageCode::ROW_DESCRIPTION {
        return codec::read_i16(&msg.data()[5..]);
    }

    0
}

/// The name of column `index` of a RowDescription. Column descriptors are
/// a NUL-terminated name followed by an 18-byte fixed tail.
pub fn row_description_name(msg: &Message, index: i16) -> Result<String> {
    const COLUMN_TAIL: usize = 4 + 2 + 4 + 2 + 4 + 2;

    let cols = row_description_columns(msg);
    if msg.kind != MessageCode::ROW_DESCRIPTION || index >= cols {
        return Err(Error::Protocol(format!(
            "no column {index} in row description"
        )));
    }

    let mut offset = 7;
    for _ in 0..index {
        let name = codec::read_string(&msg.data()[offset..])?;
        offset += name.len() + 1 + COLUMN_TAIL;
    }

    Ok(codec::read_string(&msg.data()[offset..])?.to_string())
}

/// The human-readable tag of a CommandComplete, without its trailing NUL.
pub fn command_complete_tag(msg: &Message) -> Option<Bytes> {
    if msg.kind != MessageCode::COMMAND_COMPLETE {
        return None;
    }

    let length = codec::read_i32(&msg.data()[1..]) - 5;
    if length <= 0 {
        return None;
    }

    Some(Bytes::copy_from_slice(&msg.data()[5..5 + length as usize]))
}

/// Extracts one field of an ErrorResponse or NoticeResponse by scanning
/// the `(field_type, NUL-terminated value)` sequence. The scan terminates
/// on a zero field byte or message end.
pub fn extract_error_field(field_type: u8, msg: &Message) -> Option<String> {
    let mut offset = 1 + 4;

    while offset < msg.len() {
        let field = msg.data()[offset];
        if field == 0 {
            break;
        }
        offset += 1;

        let value = codec::read_string(&msg.data()[offset..]).ok()?;
        if field == field_type {
            return Some(value.to_string());
        }
        offset += value.len() + 1;
    }

    None
}

/// Logs the `M` and SQLSTATE `C` fields of an ErrorResponse at error
/// level, and any remaining fields at debug.
pub fn log_error_response(msg: &Message) {
    if msg.kind != MessageCode::ERROR_RESPONSE {
        return;
    }

    let message = extract_error_field(b'M', msg).unwrap_or_default();
    let code = extract_error_field(b'C', msg).unwrap_or_default();
    error!("error response message: {message} (SQLSTATE code: {code})");

    log_remaining_fields(msg);
}

/// As [`log_error_response`], at warn level for NoticeResponse frames.
pub fn log_notice_response(msg: &Message) {
    if msg.kind != MessageCode::NOTICE_RESPONSE {
        return;
    }

    let message = extract_error_field(b'M', msg).unwrap_or_default();
    let code = extract_error_field(b'C', msg).unwrap_or_default();
    warn!("notice response message: {message} (SQLSTATE code: {code})");

    log_remaining_fields(msg);
}

fn log_remaining_fields(msg: &Message) {
    let mut offset = 1 + 4;

    while offset < msg.len() {
        let field = msg.data()[offset];
        if field == 0 {
            break;
        }
        offset += 1;

        let Ok(value) = codec::read_string(&msg.data()[offset..]) else {
            return;
        };
        if field != b'M' && field != b'C' {
            debug!("response field type: {}, message: {value}", field as char);
        }
        offset += value.len() + 1;
    }
}

/// Logs the reason of a CopyFail frame.
pub fn log_copyfail(msg: &Message) {
    if msg.kind != MessageCode::COPY_FAIL {
        return;
    }

    if let Ok(reason) = codec::read_string(&msg.data()[5..]) {
        error!("COPY-failure: {reason}");
    }
}

/// Pulls `user`, `database` and `application_name` out of a received
/// StartupMessage parameter list.
pub fn extract_username_database(
    msg: &Message,
) -> Result<(String, Option<String>, Option<String>)> {
    let mut username = None;
    let mut database = None;
    let mut appname = None;

    let mut offset = 8;
    while offset < msg.len() && msg.data()[offset] != 0 {
        let key = codec::read_string(&msg.data()[offset..])?;
        offset += key.len() + 1;
        let value = codec::read_string(&msg.data()[offset..])?;
        offset += value.len() + 1;

        match key {
            "user" => username = Some(value.to_string()),
            "database" => database = Some(value.to_string()),
            "application_name" => appname = Some(value.to_string()),
            _ => {}
        }
    }

    let username =
        username.ok_or_else(|| Error::Protocol("startup message carries no user".into()))?;

    Ok((username, database, appname))
}

fn tagged(kind: MessageCode, payload_fn: impl FnOnce(&mut BytesMut)) -> Message {
    let mut buf = BytesMut::new();
    buf.put_u8(kind.into());
    crate::messages::frontend::frame(&mut buf, payload_fn);
    Message::from_parts(kind.into(), buf)
}

/// AuthenticationSASL challenge advertising SCRAM-SHA-256, with the
/// mechanism list terminator.
pub fn auth_scram256() -> Message {
    tagged(MessageCode::AUTHENTICATION, |b| {
        b.put_i32(10);
        put_cstring(b, b"SCRAM-SHA-256");
        b.put_u8(0);
    })
}

/// AuthenticationSASLContinue carrying
/// `r=<client-nonce><server-nonce>,s=<salt>,i=4096`.
pub fn auth_scram256_continue(client_nonce: &str, server_nonce: &str, salt: &str) -> Message {
    tagged(MessageCode::AUTHENTICATION, |b| {
        b.put_i32(11);
        b.put_slice(b"r=");
        b.put_slice(client_nonce.as_bytes());
        b.put_slice(server_nonce.as_bytes());
        b.put_slice(b",s=");
        b.put_slice(salt.as_bytes());
        b.put_slice(b",i=4096");
    })
}

/// AuthenticationSASLFinal carrying the server signature `v=<ss>`.
pub fn auth_scram256_final(server_signature: &str) -> Message {
    tagged(MessageCode::AUTHENTICATION, |b| {
        b.put_i32(12);
        b.put_slice(b"v=");
        b.put_slice(server_signature.as_bytes());
    })
}

/// AuthenticationOk.
pub fn auth_success() -> Message {
    tagged(MessageCode::AUTHENTICATION, |b| {
        b.put_i32(0);
    })
}

/// The fixed ErrorResponse sent to reject a client before handshake.
pub fn connection_refused() -> Message {
    tagged(MessageCode::ERROR_RESPONSE, |b| {
        put_cstring(b, b"SFATAL");
        put_cstring(b, b"VFATAL");
        put_cstring(b, b"C53300");
        put_cstring(b, b"Mconnection refused");
    })
}

/// The single-byte notice answer to a negotiation request.
pub fn notice() -> Message {
    single_byte(b'N')
}

/// The single-byte `S` answer accepting an SSLRequest.
pub fn tls_supported() -> Message {
    single_byte(b'S')
}

/// An empty (single zero byte) message.
pub fn empty() -> Message {
    single_byte(0)
}

fn single_byte(b: u8) -> Message {
    let mut data = BytesMut::with_capacity(1);
    data.put_u8(b);
    Message::from_parts(b, data)
}

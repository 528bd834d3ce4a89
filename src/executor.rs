//! Simple-query execution: request/reply correlation and decoding of
//! `RowDescription` + `DataRow` sequences into tuples.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::codec;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::messages::backend;
use crate::transport::{ReadStatus, Transport};

/// One decoded row. A `None` cell is a NULL from the wire (`length ==
/// -1`), distinct from an empty byte string.
pub type Tuple = Vec<Option<Bytes>>;

/// The decoded reply of a simple query.
#[derive(Debug, Default)]
pub struct QueryResponse {
    pub number_of_columns: i16,
    pub names: Vec<String>,
    pub tuples: Vec<Tuple>,
    pub is_command_complete: bool,
}

impl QueryResponse {
    /// The value of `column` in the first tuple, if any.
    pub fn value(&self, column: usize) -> Option<&[u8]> {
        if column >= self.number_of_columns as usize {
            return None;
        }

        self.tuples
            .first()
            .and_then(|t| t.get(column))
            .and_then(|cell| cell.as_deref())
    }

    /// Dumps the shape of the response at trace level.
    pub fn dump(&self) {
        trace!("Query Response");
        trace!("Columns: {}", self.number_of_columns);
        for name in &self.names {
            trace!("Column: {name}");
        }
        trace!("Tuples: {}", self.tuples.len());
    }
}

/// Sends `query` and accumulates reply frames until a `ReadyForQuery`
/// (`Z`) terminator arrives, then classifies the reply.
///
/// Replies are delivered in wire order; `DataRow` order is preserved by
/// appending to the tail of `tuples`. A non-OK read after partial
/// accumulation is fatal for the query; there is no resync.
pub async fn execute<S>(transport: &mut Transport<S>, query: &Message) -> Result<QueryResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    transport.write(query).await?;

    trace!("Query request -- BEGIN");
    query.dump();
    trace!("Query request -- END");

    let mut data = BytesMut::new();

    loop {
        match transport.read(true, None).await? {
            ReadStatus::Message(reply) => {
                data.extend_from_slice(reply.data());
                let complete = has_message(b'Z', &data);
                transport.recycle(reply);

                if complete {
                    break;
                }
            }
            ReadStatus::Zero => {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }

    trace!("Query response -- BEGIN");
    trace!(length = data.len(), "accumulated");
    trace!("Query response -- END");

    decode_response(&data)
}

fn decode_response(data: &[u8]) -> Result<QueryResponse> {
    if has_message(b'E', data) {
        let msg = extract_message(b'E', data)
            .ok_or_else(|| Error::Protocol("malformed error response".into()))?;

        return Err(Error::Backend {
            message: backend::extract_error_field(b'M', &msg).unwrap_or_default(),
            code: backend::extract_error_field(b'C', &msg).unwrap_or_default(),
        });
    }

    if has_message(b'T', data) {
        let rmsg = extract_message(b'T', data)
            .ok_or_else(|| Error::Protocol("malformed row description".into()))?;

        let cols = backend::row_description_columns(&rmsg);
        let mut response = QueryResponse {
            number_of_columns: cols,
            ..Default::default()
        };

        for i in 0..cols {
            response.names.push(backend::row_description_name(&rmsg, i)?);
        }

        let mut offset = 0;
        while offset < data.len() {
            let (next, msg) = extract_message_offset(offset, data);
            offset = next;

            if let Some(msg) = msg
                && msg.kind == b'D'
            {
                response.tuples.push(decode_data_row(cols, &msg));
            }
        }

        response.is_command_complete = false;

        return Ok(response);
    }

    if has_message(b'C', data) {
        let cmsg = extract_message(b'C', data)
            .ok_or_else(|| Error::Protocol("malformed command complete".into()))?;

        return Ok(QueryResponse {
            number_of_columns: 1,
            names: Vec::new(),
            tuples: vec![vec![backend::command_complete_tag(&cmsg)]],
            is_command_complete: true,
        });
    }

    debug!("response carries no row description, command tag or error");

    Err(Error::Protocol(
        "response carries no row description, command tag or error".into(),
    ))
}

/// Walks `data` as a sequence of tagged frames, stepping by
/// `1 + read_i32` per frame, and reports whether any frame carries `tag`.
/// Never reads past the end of `data`. An `E` match additionally logs the
/// error fields of the first matching frame.
pub fn has_message(tag: u8, data: &[u8]) -> bool {
    let mut offset = 0;

    while offset + 5 <= data.len() {
        let t = data[offset];

        if t == tag {
            if tag == b'E'
                && let (_, Some(msg)) = extract_message_offset(offset, data)
            {
                backend::log_error_response(&msg);
            }
            return true;
        }

        let length = codec::read_i32(&data[offset + 1..]);
        if length < 4 {
            return false;
        }
        offset += 1 + length as usize;
    }

    false
}

/// Extracts the first frame with `tag` from the accumulated reply bytes.
pub fn extract_message(tag: u8, data: &[u8]) -> Option<Message> {
    let mut offset = 0;

    while offset + 5 <= data.len() {
        let t = data[offset];
        let length = codec::read_i32(&data[offset + 1..]);
        if length < 4 {
            return None;
        }

        if t == tag {
            let (_, msg) = extract_message_offset(offset, data);
            return msg;
        }

        offset += 1 + length as usize;
    }

    None
}

/// Extracts the frame starting at `offset`, returning the offset of the
/// next frame. A truncated or malformed tail yields `(data.len(), None)`.
pub fn extract_message_offset(offset: usize, data: &[u8]) -> (usize, Option<Message>) {
    if offset + 5 > data.len() {
        return (data.len(), None);
    }

    let kind = data[offset];
    let length = codec::read_i32(&data[offset + 1..]);
    if length < 4 {
        return (data.len(), None);
    }

    let end = offset + 1 + length as usize;
    if end > data.len() {
        return (data.len(), None);
    }

    let mut msg = Message::allocate(1 + length as usize);
    msg.kind = kind;
    msg.data_mut().copy_from_slice(&data[offset..end]);

    (end, Some(msg))
}

/// Decodes a DataRow: cells start at offset 7 (tag + length +
/// column-count), each an i32 length then that many value bytes, with
/// `-1` meaning NULL.
fn decode_data_row(number_of_columns: i16, msg: &Message) -> Tuple {
    let mut tuple = Tuple::with_capacity(number_of_columns as usize);
    let mut offset = 7;

    for _ in 0..number_of_columns {
        let length = codec::read_i32(&msg.data()[offset..]);
        offset += 4;

        if length >= 0 {
            let value = Bytes::copy_from_slice(&msg.data()[offset..offset + length as usize]);
            offset += length as usize;
            tuple.push(Some(value));
        } else {
            tuple.push(None);
        }
    }

    tuple
}

//! Framed reads and writes over a plain socket or a TLS session.
//!
//! Both variants share one contract. A read draws a reusable buffer from
//! the connection's [`MessageMemory`], pulls up to [`DEFAULT_BUFFER_SIZE`]
//! bytes and hands back a [`Message`] whose kind is the first byte seen.
//! A short read is still OK; framing is resolved by the accumulator scan
//! in the executor, the kind here is advisory. Timeouts are end-to-end
//! per call and are never silently extended.
//!
//! The OpenSSL `WANT_*` retry table becomes [`RetryClass`]: rustls
//! reschedules handshake-level retries internally, so what remains to
//! classify are the I/O error kinds.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::DEFAULT_BUFFER_SIZE;
use crate::error::Result;
use crate::message::{Message, MessageMemory};

/// Outcome of a transport read.
///
/// `Zero` means no data arrived within the window (or the peer shut the
/// stream down cleanly); the caller may retry. Unrecoverable failures are
/// `Err` on the read itself.
#[derive(Debug)]
pub enum ReadStatus {
    Message(Message),
    Zero,
}

/// How an I/O error is handled inside the read/write loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retry,
    Fatal,
}

impl RetryClass {
    pub fn of(err: &std::io::Error) -> Self {
        use std::io::ErrorKind::*;

        match err.kind() {
            WouldBlock | Interrupted | TimedOut => RetryClass::Retry,
            _ => RetryClass::Fatal,
        }
    }
}

/// A framed transport over any async byte stream; the plain variant wraps
/// a [`TcpStream`], the TLS variant a
/// [`tokio_rustls::client::TlsStream`].
pub struct Transport<S> {
    stream: S,
    memory: MessageMemory,
}

pub type TlsTransport = Transport<tokio_rustls::client::TlsStream<TcpStream>>;

impl<S> Transport<S> {
    pub fn new(stream: S) -> Self {
        Transport {
            stream,
            memory: MessageMemory::new(),
        }
    }

    /// Consumes the transport and returns the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Returns a consumed message's buffer to the connection pool.
    pub fn recycle(&mut self, msg: Message) {
        self.memory.release(msg.into_data());
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    /// Reads the next chunk of protocol bytes.
    ///
    /// With a timeout the deadline covers the whole call. A clean
    /// zero-byte read maps to [`ReadStatus::Zero`] once the window is
    /// exhausted; while the window is open the call sleeps 100 ms and
    /// retries, which is how a TLS session surfaces its end-of-stream
    /// between WAL bursts.
    pub async fn read(&mut self, block: bool, timeout: Option<Duration>) -> Result<ReadStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let mut buf = self.memory.acquire();
            buf.resize(DEFAULT_BUFFER_SIZE, 0);

            let read = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await {
                        Ok(read) => read,
                        Err(_) => {
                            self.memory.release(buf);
                            return Ok(ReadStatus::Zero);
                        }
                    }
                }
                None => self.stream.read(&mut buf).await,
            };

            match read {
                Ok(0) => {
                    self.memory.release(buf);

                    match deadline {
                        Some(deadline) if Instant::now() < deadline => {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                        _ => return Ok(ReadStatus::Zero),
                    }
                }
                Ok(n) => {
                    buf.truncate(n);
                    let kind = buf[0];
                    return Ok(ReadStatus::Message(Message::from_parts(kind, buf)));
                }
                Err(e) => {
                    self.memory.release(buf);

                    match RetryClass::of(&e) {
                        RetryClass::Retry if block => continue,
                        RetryClass::Retry => return Ok(ReadStatus::Zero),
                        RetryClass::Fatal => {
                            error!("transport read failed: {e}");
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    /// Writes the complete wire image of `msg`, chunking each syscall to
    /// at most [`DEFAULT_BUFFER_SIZE`] bytes and looping until all
    /// `length` bytes are out.
    pub async fn write(&mut self, msg: &Message) -> Result<()> {
        let data = msg.data();
        let mut offset = 0;

        while offset < data.len() {
            let end = usize::min(offset + DEFAULT_BUFFER_SIZE, data.len());

            match self.stream.write(&data[offset..end]).await {
                Ok(0) => {
                    error!("transport write made no progress at {offset}/{}", data.len());
                    return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
                }
                Ok(n) => {
                    offset += n;
                    if offset < data.len() {
                        debug!("partial write {offset}/{}", data.len());
                    }
                }
                Err(e) => match RetryClass::of(&e) {
                    RetryClass::Retry => continue,
                    RetryClass::Fatal => {
                        error!("transport write failed: {e}");
                        return Err(e.into());
                    }
                },
            }
        }

        self.stream.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::frontend;

    #[tokio::test]
    async fn test_read_returns_message_with_advisory_kind() {
        let (client, mut server) = tokio::io::duplex(DEFAULT_BUFFER_SIZE);
        let mut transport = Transport::new(client);

        tokio::io::AsyncWriteExt::write_all(&mut server, &[b'Z', 0, 0, 0, 5, b'I'])
            .await
            .unwrap();

        let status = transport.read(true, None).await.unwrap();
        let ReadStatus::Message(msg) = status else {
            panic!("expected a message");
        };
        assert_eq!(b'Z', msg.kind);
        assert_eq!(6, msg.len());
    }

    #[tokio::test]
    async fn test_read_timeout_returns_zero() {
        let (client, _server) = tokio::io::duplex(64);
        let mut transport = Transport::new(client);

        let status = transport
            .read(true, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(matches!(status, ReadStatus::Zero));
    }

    #[tokio::test]
    async fn test_read_closed_stream_returns_zero() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut transport = Transport::new(client);

        let status = transport.read(true, None).await.unwrap();
        assert!(matches!(status, ReadStatus::Zero));
    }

    #[tokio::test]
    async fn test_write_round_trip() {
        let (client, mut server) = tokio::io::duplex(DEFAULT_BUFFER_SIZE);
        let mut transport = Transport::new(client);

        let msg = frontend::query("SELECT 1;").unwrap();
        transport.write(&msg).await.unwrap();

        let mut buf = vec![0u8; msg.len()];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut buf)
            .await
            .unwrap();
        assert_eq!(msg.data(), &buf[..]);
    }

    #[tokio::test]
    async fn test_recycled_buffers_are_reused() {
        let (client, mut server) = tokio::io::duplex(DEFAULT_BUFFER_SIZE);
        let mut transport = Transport::new(client);

        tokio::io::AsyncWriteExt::write_all(&mut server, b"hello")
            .await
            .unwrap();
        let ReadStatus::Message(msg) = transport.read(true, None).await.unwrap() else {
            panic!("expected a message");
        };
        transport.recycle(msg);

        tokio::io::AsyncWriteExt::write_all(&mut server, b"again")
            .await
            .unwrap();
        let ReadStatus::Message(msg) = transport.read(true, None).await.unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(b"again", msg.data());
    }

    #[test]
    fn test_retry_classification() {
        use std::io::{Error, ErrorKind};

        assert_eq!(
            RetryClass::Retry,
            RetryClass::of(&Error::from(ErrorKind::WouldBlock))
        );
        assert_eq!(
            RetryClass::Retry,
            RetryClass::of(&Error::from(ErrorKind::Interrupted))
        );
        assert_eq!(
            RetryClass::Retry,
            RetryClass::of(&Error::from(ErrorKind::TimedOut))
        );
        assert_eq!(
            RetryClass::Fatal,
            RetryClass::of(&Error::from(ErrorKind::ConnectionReset))
        );
        assert_eq!(
            RetryClass::Fatal,
            RetryClass::of(&Error::from(ErrorKind::BrokenPipe))
        );
    }
}

//! Client-facing authentication: the engine answers startup negotiation
//! and challenges connecting clients with SCRAM-SHA-256 on behalf of the
//! backends it fronts.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::codec;
use crate::config::User;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::messages::backend;
use crate::startup::scram::ScramServer;
use crate::{PROTOCOL_VERSION, SSL_REQUEST_CODE};

/// Identity negotiated with an authenticated client.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub username: String,
    pub database: Option<String>,
    pub application_name: Option<String>,
}

/// Authenticates connecting clients against the configured user table.
pub struct Authenticator<'a> {
    users: &'a [User],
    timeout: Duration,
}

impl<'a> Authenticator<'a> {
    pub fn new(users: &'a [User], timeout: Duration) -> Self {
        Authenticator { users, timeout }
    }

    /// Drives startup negotiation and the SCRAM-SHA-256 exchange with a
    /// client. The whole handshake is bounded by the authentication
    /// timeout; an unknown user or a failed proof is answered with the
    /// connection-refused response before the error is returned.
    pub async fn authenticate<S>(&self, stream: &mut S) -> Result<ClientSession>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match tokio::time::timeout(self.timeout, self.handshake(stream)).await {
            Ok(session) => session,
            Err(_) => Err(Error::Authentication("authentication timeout".into())),
        }
    }

    async fn handshake<S>(&self, stream: &mut S) -> Result<ClientSession>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut msg = backend::read_startup_frame(&mut *stream).await?;

        // No TLS termination is wired toward clients; decline the
        // SSLRequest and expect the cleartext startup to follow.
        if backend::request_id(&msg) == SSL_REQUEST_CODE {
            stream.write_all(backend::notice().data()).await?;
            stream.flush().await?;
            msg = backend::read_startup_frame(&mut *stream).await?;
        }

        if backend::request_id(&msg) != PROTOCOL_VERSION {
            self.refuse(stream).await?;
            return Err(Error::Protocol(format!(
                "unsupported protocol request {}",
                backend::request_id(&msg)
            )));
        }

        let (username, database, application_name) = backend::extract_username_database(&msg)?;
        debug!("startup from {username}");

        let Some(user) = self.users.iter().find(|u| u.username == username) else {
            self.refuse(stream).await?;
            return Err(Error::Authentication(format!("unknown user {username}")));
        };

        self.scram_exchange(stream, user).await?;

        info!("client {username} authenticated");

        Ok(ClientSession {
            username,
            database,
            application_name,
        })
    }

    async fn scram_exchange<S>(&self, stream: &mut S, user: &User) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(backend::auth_scram256().data()).await?;
        stream.flush().await?;

        let initial = backend::read_frame(&mut *stream).await?;
        let (client_first_bare, client_nonce) = parse_initial_response(&initial)?;

        let scram = ScramServer::new(&user.password);
        let answer = backend::auth_scram256_continue(
            &client_nonce,
            scram.server_nonce(),
            &scram.salt_base64(),
        );
        stream.write_all(answer.data()).await?;
        stream.flush().await?;

        let reply = backend::read_frame(&mut *stream).await?;
        if reply.kind != b'p' {
            self.refuse(stream).await?;
            return Err(Error::Protocol(format!(
                "unexpected message kind {} in authentication",
                reply.kind as char
            )));
        }
        let client_final = String::from_utf8_lossy(&reply.data()[5..]).to_string();

        let signature = match scram.verify_client_final(
            &client_first_bare,
            &client_nonce,
            &client_final,
        ) {
            Ok(signature) => signature,
            Err(e) => {
                self.refuse(stream).await?;
                return Err(e);
            }
        };

        stream
            .write_all(backend::auth_scram256_final(&signature).data())
            .await?;
        stream.write_all(backend::auth_success().data()).await?;
        stream.flush().await?;

        Ok(())
    }

    async fn refuse<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream
            .write_all(backend::connection_refused().data())
            .await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Splits a SASLInitialResponse into the client-first-message-bare as
/// transmitted and the client nonce.
fn parse_initial_response(msg: &Message) -> Result<(String, String)> {
    if msg.kind != b'p' {
        return Err(Error::Protocol(format!(
            "unexpected message kind {} in authentication",
            msg.kind as char
        )));
    }

    let mechanism = codec::read_string(&msg.data()[5..])?;
    if mechanism != "SCRAM-SHA-256" {
        return Err(Error::Authentication(format!(
            "unsupported authentication mechanism {mechanism}"
        )));
    }

    let offset = 5 + mechanism.len() + 1;
    let length = codec::read_i32(&msg.data()[offset..]);
    if length < 0 || offset + 4 + length as usize > msg.len() {
        return Err(Error::Protocol("malformed SASL initial response".into()));
    }

    let payload = &msg.data()[offset + 4..offset + 4 + length as usize];
    let client_first = std::str::from_utf8(payload)
        .map_err(|_| Error::Protocol("SASL payload is not UTF-8".into()))?;

    let bare_start = client_first
        .find("n=")
        .ok_or_else(|| Error::Protocol("missing username attribute".into()))?;
    let bare = &client_first[bare_start..];

    let nonce = bare
        .split(',')
        .find_map(|part| part.strip_prefix("r="))
        .ok_or_else(|| Error::Protocol("missing client nonce".into()))?;

    Ok((bare.to_string(), nonce.to_string()))
}

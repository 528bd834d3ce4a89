//! Connection establishment: startup handshake and authentication
//! against a PostgreSQL backend.

use std::collections::HashMap;

use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::warn;

use crate::codec;
use crate::error::{Error, Result};
use crate::messages::{backend, frontend};
use crate::startup::auth::{AuthMessage, read_auth_message};
use crate::transport::Transport;
use crate::POSTGRESQL_MIN_VERSION;

mod auth;
mod scram;
mod server;

pub use scram::{ScramServer, ScramSha256};
pub use server::{Authenticator, ClientSession};

/// Authentication mode for a backend connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthenticationMode {
    /// Trust authentication (no password required).
    Trust,
    /// Password authentication; covers cleartext, MD5 and SCRAM-SHA-256
    /// challenges.
    Password(String),
}

/// Response data from a successful startup handshake.
#[derive(Debug, Clone)]
pub struct StartupResponse {
    /// Backend process ID for this connection.
    pub process_id: u32,
    /// Secret key for canceling queries on this connection.
    pub secret_key: u32,
    /// Server parameters returned during startup (e.g., server_version).
    pub parameters: HashMap<String, String>,
}

/// Builder for configuring and establishing backend connections.
pub struct ConnectionBuilder {
    user: String,
    database: Option<String>,
    replication: bool,
    auth: AuthenticationMode,
}

impl ConnectionBuilder {
    /// Creates a new connection builder with the specified user.
    ///
    /// Defaults to trust authentication; the database defaults to the
    /// username.
    pub fn new(user: impl Into<String>) -> Self {
        ConnectionBuilder {
            user: user.into(),
            database: None,
            replication: false,
            auth: AuthenticationMode::Trust,
        }
    }

    /// Sets the database name to connect to.
    pub fn database(mut self, db: impl Into<String>) -> Self {
        self.database = Some(db.into());
        self
    }

    /// Requests a replication connection.
    pub fn replication(mut self, replication: bool) -> Self {
        self.replication = replication;
        self
    }

    /// Sets the authentication mode.
    pub fn auth(mut self, auth: AuthenticationMode) -> Self {
        self.auth = auth;
        self
    }

    /// Establishes a connection with TLS: sends an SSLRequest and
    /// upgrades through the connector if the server accepts.
    pub async fn connect_with_tls(
        &self,
        mut stream: TcpStream,
        connector: &TlsConnector,
        domain: &str,
    ) -> Result<(
        Transport<tokio_rustls::client::TlsStream<TcpStream>>,
        StartupResponse,
    )> {
        let request = frontend::ssl_request();
        stream.write_all(request.data()).await?;
        stream.flush().await?;

        let mut answer = [0; 1];
        stream.read_exact(&mut answer).await?;

        match answer[0] {
            b'S' => {
                let name = rustls::pki_types::ServerName::try_from(domain.to_string())
                    .map_err(|e| Error::Protocol(format!("invalid server name: {e}")))?;
                let stream = connector.connect(name, stream).await?;
                self.connect(stream).await
            }
            b'N' => Err(Error::TlsUnsupported),
            answer => Err(Error::Protocol(format!(
                "unexpected SSL response code '{}'",
                answer as char
            ))),
        }
    }

    /// Establishes a connection over the provided stream: performs the
    /// startup handshake, authenticates, and collects server parameters
    /// until the backend is ready for queries.
    pub async fn connect<S>(&self, mut stream: S) -> Result<(Transport<S>, StartupResponse)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.startup(&mut stream).await?;

        let mut response = StartupResponse {
            process_id: 0,
            secret_key: 0,
            parameters: HashMap::new(),
        };

        loop {
            let msg = backend::read_frame(&mut stream).await?;

            match msg.kind {
                k if k == backend::MessageCode::PARAMETER_STATUS => {
                    let key = codec::read_string(&msg.data()[5..])?.to_string();
                    let value = codec::read_string(&msg.data()[5 + key.len() + 1..])?.to_string();
                    response.parameters.insert(key, value);
                }
                k if k == backend::MessageCode::BACKEND_KEY_DATA => {
                    response.process_id = codec::read_u32(&msg.data()[5..]);
                    response.secret_key = codec::read_u32(&msg.data()[9..]);
                }
                k if k == backend::MessageCode::NOTICE_RESPONSE => {
                    backend::log_notice_response(&msg);
                }
                k if k == backend::MessageCode::ERROR_RESPONSE => {
                    backend::log_error_response(&msg);
                    return Err(Error::Backend {
                        message: backend::extract_error_field(b'M', &msg).unwrap_or_default(),
                        code: backend::extract_error_field(b'C', &msg).unwrap_or_default(),
                    });
                }
                k if k == backend::MessageCode::READY_FOR_QUERY => break,
                kind => {
                    return Err(Error::Protocol(format!(
                        "unexpected message kind {}",
                        kind as char
                    )));
                }
            }
        }

        check_version_floor(&response)?;

        Ok((Transport::new(stream), response))
    }

    async fn startup<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let database = self.database.as_deref().unwrap_or(&self.user);
        let msg = frontend::startup(&self.user, database, self.replication);
        stream.write_all(msg.data()).await?;
        stream.flush().await?;

        loop {
            match read_auth_message(stream).await? {
                AuthMessage::Ok => return Ok(()),
                AuthMessage::CleartextPassword => {
                    let password = self.password()?;
                    let msg = frontend::auth_password(password);
                    stream.write_all(msg.data()).await?;
                    stream.flush().await?;
                }
                AuthMessage::Md5Password(salt) => {
                    let password = self.password()?;
                    let msg = frontend::auth_md5(&md5_digest(&self.user, password, &salt));
                    stream.write_all(msg.data()).await?;
                    stream.flush().await?;
                }
                AuthMessage::Sasl(_mech) => {
                    self.sasl(stream).await?;
                }
                other => {
                    return Err(Error::Authentication(format!(
                        "unsupported authentication request {other}"
                    )));
                }
            }
        }
    }

    async fn sasl<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let password = self.password()?;
        let mut scram = ScramSha256::new(password);

        let msg = frontend::auth_scram256_initial(scram.nonce());
        stream.write_all(msg.data()).await?;
        stream.flush().await?;

        let answer = read_auth_message(stream).await?;
        let AuthMessage::SaslContinue(server_first) = answer else {
            return Err(Error::Authentication(format!(
                "unexpected authentication response {answer}"
            )));
        };

        let (without_proof, proof) = scram.process_server_first(&server_first)?;
        let msg = frontend::auth_scram256_proof(&without_proof, &proof);
        stream.write_all(msg.data()).await?;
        stream.flush().await?;

        let answer = read_auth_message(stream).await?;
        let AuthMessage::SaslFinal(server_final) = answer else {
            return Err(Error::Authentication(format!(
                "unexpected authentication response {answer}"
            )));
        };
        scram.verify_server_final(&server_final)?;

        Ok(())
    }

    fn password(&self) -> Result<&str> {
        match &self.auth {
            AuthenticationMode::Password(password) => Ok(password),
            AuthenticationMode::Trust => {
                Err(Error::Authentication("password is required".into()))
            }
        }
    }
}

/// `md5` + hex(md5(hex(md5(password + user)) + salt)), the MD5 password
/// response digest.
fn md5_digest(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = Md5::new()
        .chain_update(password.as_bytes())
        .chain_update(user.as_bytes())
        .finalize();

    let outer = Md5::new()
        .chain_update(hex(&inner).as_bytes())
        .chain_update(salt)
        .finalize();

    format!("md5{}", hex(&outer))
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

/// The backend version floor is PostgreSQL 13; older servers are refused
/// when the version is reported.
fn check_version_floor(response: &StartupResponse) -> Result<()> {
    let Some(version) = response.parameters.get("server_version") else {
        return Ok(());
    };

    let major: Option<i32> = version
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|v| v.parse().ok());

    match major {
        Some(major) if major < POSTGRESQL_MIN_VERSION => Err(Error::Protocol(format!(
            "PostgreSQL {POSTGRESQL_MIN_VERSION}+ required, server is {version}"
        ))),
        None => {
            warn!("unparsable server_version: {version}");
            Ok(())
        }
        _ => Ok(()),
    }
}

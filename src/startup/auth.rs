use tokio::io::AsyncRead;

use crate::codec;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::messages::backend;

pub(crate) enum AuthMessage {
    Ok,
    KerberosV5,
    CleartextPassword,
    Md5Password([u8; 4]),
    Gss,
    GssContinue,
    Sspi,
    Sasl(AuthMechanism),
    SaslContinue(String),
    SaslFinal(String),
}

impl std::fmt::Display for AuthMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMessage::Ok => write!(f, "AuthenticationOk"),
            AuthMessage::KerberosV5 => write!(f, "AuthenticationKerberosV5"),
            AuthMessage::CleartextPassword => write!(f, "AuthenticationCleartextPassword"),
            AuthMessage::Md5Password(_salt) => write!(f, "AuthenticationMD5Password"),
            AuthMessage::Gss => write!(f, "AuthenticationGSS"),
            AuthMessage::GssContinue => write!(f, "AuthenticationGSSContinue"),
            AuthMessage::Sspi => write!(f, "AuthenticationSSPI"),
            AuthMessage::Sasl(mech) => write!(f, "AuthenticationSASL({mech})"),
            AuthMessage::SaslContinue(_) => write!(f, "AuthenticationSASLContinue"),
            AuthMessage::SaslFinal(_) => write!(f, "AuthenticationSASLFinal"),
        }
    }
}

pub(crate) enum AuthMechanism {
    ScramSha256,
}

impl std::fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ScramSha256 => "SCRAM-SHA-256",
        };
        write!(f, "{name}")
    }
}

impl TryFrom<&str> for AuthMechanism {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "SCRAM-SHA-256" => Ok(AuthMechanism::ScramSha256),
            _ => Err(Error::Authentication(format!(
                "unsupported authentication mechanism {value}"
            ))),
        }
    }
}

/// Reads and classifies the next authentication frame.
pub(crate) async fn read_auth_message<S>(stream: &mut S) -> Result<AuthMessage>
where
    S: AsyncRead + Unpin,
{
    let msg = backend::read_frame(stream).await?;

    match msg.kind {
        k if k == backend::MessageCode::ERROR_RESPONSE => {
            backend::log_error_response(&msg);
            Err(Error::Backend {
                message: backend::extract_error_field(b'M', &msg).unwrap_or_default(),
                code: backend::extract_error_field(b'C', &msg).unwrap_or_default(),
            })
        }
        k if k == backend::MessageCode::AUTHENTICATION => classify(&msg),
        _ => Err(Error::Protocol(format!(
            "unexpected message kind {}",
            msg.kind as char
        ))),
    }
}

fn classify(msg: &Message) -> Result<AuthMessage> {
    let code = codec::read_i32(&msg.data()[5..]);
    let body = &msg.data()[9..];

    let auth = match code {
        0 => AuthMessage::Ok,
        2 => AuthMessage::KerberosV5,
        3 => AuthMessage::CleartextPassword,
        5 => {
            let salt: [u8; 4] = body.try_into().map_err(|_| {
                Error::Protocol("unexpected body length in md5 password challenge".into())
            })?;
            AuthMessage::Md5Password(salt)
        }
        7 => AuthMessage::Gss,
        8 => AuthMessage::GssContinue,
        9 => AuthMessage::Sspi,
        10 => {
            let mech = body
                .split(|b| *b == 0)
                .map(String::from_utf8_lossy)
                .find_map(|m| AuthMechanism::try_from(m.as_ref()).ok())
                .ok_or_else(|| {
                    Error::Authentication("no supported authentication mechanisms".into())
                })?;
            AuthMessage::Sasl(mech)
        }
        11 => AuthMessage::SaslContinue(String::from_utf8_lossy(body).to_string()),
        12 => AuthMessage::SaslFinal(String::from_utf8_lossy(body).to_string()),
        code => {
            return Err(Error::Authentication(format!(
                "unexpected auth response code {code}"
            )));
        }
    };

    Ok(auth)
}

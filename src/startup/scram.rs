//! SCRAM-SHA-256 state machines (RFC 5802, RFC 7677), client and server
//! roles.
//!
//! Produces the values the message constructors frame: the client nonce
//! for the initial response, the channel-binding-plus-nonce blob and the
//! base64 proof for the continue response, and on the server side the
//! salt, combined nonce and signature of the challenge sequence.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LENGTH: usize = 24;

/// The advertised iteration count for server-side exchanges.
pub const SCRAM_ITERATIONS: u32 = 4096;

pub(crate) fn generate_nonce() -> String {
    let mut rng = rand::rng();
    (0..NONCE_LENGTH)
        .map(|_| {
            const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
            CHARS[rng.random_range(0..CHARS.len())] as char
        })
        .collect()
}

pub struct ScramSha256 {
    password: String,
    client_nonce: String,
    salted_password: Option<Vec<u8>>,
    auth_message: Option<String>,
}

impl ScramSha256 {
    pub fn new(password: &str) -> Self {
        Self::with_nonce(password, &generate_nonce())
    }

    pub fn with_nonce(password: &str, nonce: &str) -> Self {
        ScramSha256 {
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            salted_password: None,
            auth_message: None,
        }
    }

    pub fn nonce(&self) -> &str {
        &self.client_nonce
    }

    /// The client-first-message-bare; the username is carried by the
    /// startup message, so `n=` stays empty.
    fn client_first_bare(&self) -> String {
        format!("n=,r={}", self.client_nonce)
    }

    /// Processes the server-first-message `r=<nonce>,s=<salt>,i=<count>`
    /// and returns the client-final-message-without-proof and the base64
    /// proof.
    pub fn process_server_first(&mut self, server_first: &str) -> Result<(String, String)> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("s=") {
                let decoded = BASE64
                    .decode(value)
                    .map_err(|_| Error::Authentication("invalid salt base64".into()))?;
                salt = Some(decoded);
            } else if let Some(value) = part.strip_prefix("i=") {
                let count = value
                    .parse::<u32>()
                    .map_err(|_| Error::Authentication("invalid iteration count".into()))?;
                iterations = Some(count);
            }
        }

        let nonce = nonce.ok_or_else(|| Error::Authentication("missing server nonce".into()))?;
        let salt = salt.ok_or_else(|| Error::Authentication("missing salt".into()))?;
        let iterations =
            iterations.ok_or_else(|| Error::Authentication("missing iteration count".into()))?;

        if !nonce.starts_with(&self.client_nonce) {
            return Err(Error::Authentication(
                "server nonce does not extend the client nonce".into(),
            ));
        }

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );
        self.salted_password = Some(salted_password.to_vec());

        let client_key = hmac(&salted_password, b"Client Key")?;
        let stored_key = Sha256::digest(&client_key);

        let without_proof = format!("c=biws,r={nonce}");
        let auth_message = format!(
            "{},{server_first},{without_proof}",
            self.client_first_bare()
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
        self.auth_message = Some(auth_message);

        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        Ok((without_proof, BASE64.encode(proof)))
    }

    /// Verifies the server signature in the server-final-message `v=<sig>`.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        let verifier = server_final
            .strip_prefix("v=")
            .ok_or_else(|| Error::Authentication("missing server signature".into()))?;

        let expected = BASE64
            .decode(verifier.trim_end())
            .map_err(|_| Error::Authentication("invalid server signature base64".into()))?;

        let salted_password = self
            .salted_password
            .as_ref()
            .ok_or_else(|| Error::Authentication("handshake out of order".into()))?;
        let auth_message = self
            .auth_message
            .as_ref()
            .ok_or_else(|| Error::Authentication("handshake out of order".into()))?;

        let server_key = hmac(salted_password, b"Server Key")?;
        let signature = hmac(&server_key, auth_message.as_bytes())?;

        if signature != expected {
            return Err(Error::Authentication(
                "server signature verification failed".into(),
            ));
        }

        Ok(())
    }
}

/// SCRAM-SHA-256 server state: verifies a client proof against the
/// stored cleartext password and produces the server signature.
pub struct ScramServer {
    salt: Vec<u8>,
    server_nonce: String,
    salted_password: Vec<u8>,
}

impl ScramServer {
    pub fn new(password: &str) -> Self {
        let salt: [u8; 16] = rand::rng().random();
        Self::with_parts(password, &salt, &generate_nonce())
    }

    pub(crate) fn with_parts(password: &str, salt: &[u8], server_nonce: &str) -> Self {
        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            password.as_bytes(),
            salt,
            SCRAM_ITERATIONS,
            &mut salted_password,
        );

        ScramServer {
            salt: salt.to_vec(),
            server_nonce: server_nonce.to_string(),
            salted_password: salted_password.to_vec(),
        }
    }

    pub fn salt_base64(&self) -> String {
        BASE64.encode(&self.salt)
    }

    pub fn server_nonce(&self) -> &str {
        &self.server_nonce
    }

    /// Checks the client-final-message against the recorded exchange and
    /// returns the base64 server signature for the final message.
    ///
    /// `client_first_bare` is the bare part of the client's initial
    /// response exactly as transmitted; `client_nonce` its `r=` value.
    pub fn verify_client_final(
        &self,
        client_first_bare: &str,
        client_nonce: &str,
        client_final: &str,
    ) -> Result<String> {
        let (without_proof, proof) = client_final
            .split_once(",p=")
            .ok_or_else(|| Error::Authentication("missing client proof".into()))?;

        let combined = format!("{client_nonce}{}", self.server_nonce);
        if without_proof != format!("c=biws,r={combined}") {
            return Err(Error::Authentication(
                "client final message does not match the exchange".into(),
            ));
        }

        let proof = BASE64
            .decode(proof.trim_end())
            .map_err(|_| Error::Authentication("invalid proof base64".into()))?;

        let server_first = format!(
            "r={combined},s={},i={SCRAM_ITERATIONS}",
            self.salt_base64()
        );
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

        let client_key = hmac(&self.salted_password, b"Client Key")?;
        let stored_key = Sha256::digest(&client_key);
        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;

        if proof.len() != client_signature.len() {
            return Err(Error::Authentication("invalid proof length".into()));
        }

        let recovered_key: Vec<u8> = proof
            .iter()
            .zip(client_signature.iter())
            .map(|(p, s)| p ^ s)
            .collect();

        if Sha256::digest(&recovered_key)[..] != stored_key[..] {
            return Err(Error::Authentication("password mismatch".into()));
        }

        let server_key = hmac(&self.salted_password, b"Server Key")?;
        let server_signature = hmac(&server_key, auth_message.as_bytes())?;

        Ok(BASE64.encode(server_signature))
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| Error::Authentication("invalid HMAC key".into()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_is_alphanumeric() {
        let scram = ScramSha256::new("pw");
        assert_eq!(NONCE_LENGTH, scram.nonce().len());
        assert!(scram.nonce().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_rejects_foreign_nonce() {
        let mut scram = ScramSha256::with_nonce("pw", "clientnonce");
        let server_first = format!("r=othernonceXYZ,s={},i=4096", BASE64.encode(b"salt"));
        assert!(scram.process_server_first(&server_first).is_err());
    }

    #[test]
    fn test_full_exchange_verifies_against_server_side_math() {
        // Play the server: derive the stored key independently and check
        // the client proof, then hand back a genuine server signature.
        let password = "secret";
        let salt = b"0123456789abcdef";
        let iterations = 4096u32;

        let mut scram = ScramSha256::with_nonce(password, "rOprNGfwEbeRWgbNEkqO");
        let server_nonce = "rOprNGfwEbeRWgbNEkqOserver";
        let server_first = format!("r={server_nonce},s={},i={iterations}", BASE64.encode(salt));

        let (without_proof, proof_b64) = scram.process_server_first(&server_first).unwrap();
        assert_eq!(format!("c=biws,r={server_nonce}"), without_proof);

        // Server-side derivation.
        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut salted);
        let client_key = hmac(&salted, b"Client Key").unwrap();
        let stored_key = Sha256::digest(&client_key);

        let auth_message =
            format!("n=,r=rOprNGfwEbeRWgbNEkqO,{server_first},{without_proof}");
        let client_signature = hmac(&stored_key, auth_message.as_bytes()).unwrap();

        // RecoveredKey = Proof XOR ClientSignature must hash to StoredKey.
        let proof = BASE64.decode(proof_b64).unwrap();
        let recovered: Vec<u8> = proof
            .iter()
            .zip(client_signature.iter())
            .map(|(p, s)| p ^ s)
            .collect();
        assert_eq!(&stored_key[..], &Sha256::digest(&recovered)[..]);

        // And the client must accept the matching server signature.
        let server_key = hmac(&salted, b"Server Key").unwrap();
        let server_signature = hmac(&server_key, auth_message.as_bytes()).unwrap();
        let server_final = format!("v={}", BASE64.encode(server_signature));
        scram.verify_server_final(&server_final).unwrap();

        // A corrupted signature is refused.
        assert!(scram.verify_server_final("v=AAAA").is_err());
    }

    #[test]
    fn test_client_and_server_interoperate() {
        let mut client = ScramSha256::with_nonce("secret", "clientNONCE123");
        let server = ScramServer::with_parts("secret", b"0123456789abcdef", "serverNONCE456");

        let server_first = format!(
            "r=clientNONCE123{},s={},i={SCRAM_ITERATIONS}",
            server.server_nonce(),
            server.salt_base64()
        );

        let (without_proof, proof) = client.process_server_first(&server_first).unwrap();
        let client_final = format!("{without_proof},p={proof}");

        let signature = server
            .verify_client_final("n=,r=clientNONCE123", "clientNONCE123", &client_final)
            .unwrap();
        client
            .verify_server_final(&format!("v={signature}"))
            .unwrap();

        // A different stored password refuses the same proof.
        let wrong = ScramServer::with_parts("other", b"0123456789abcdef", "serverNONCE456");
        assert!(
            wrong
                .verify_client_final("n=,r=clientNONCE123", "clientNONCE123", &client_final)
                .is_err()
        );
    }
}

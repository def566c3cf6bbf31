//! SCRAM-SHA-256 authentication.
//!
//! Implements the client side of RFC 5802 (SCRAM) with the SHA-256 hash of
//! RFC 7677, as PostgreSQL uses it: no channel binding, empty authzid.
//!
//! The exchange is three steps, driven by the session as the server's SASL
//! messages arrive:
//!
//! 1. [`ScramClient::client_first`] for `AuthenticationSASL`
//! 2. [`ScramClient::client_final`] for `AuthenticationSASLContinue`
//! 3. [`ScramClient::verify_server_final`] for `AuthenticationSASLFinal`

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name announced in `SASLInitialResponse`.
pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header without channel binding, base64 encoded (`n,,`).
const CHANNEL_BINDING: &str = "biws";

#[derive(Debug)]
enum State {
    /// Client-first not sent yet.
    Initial,
    /// Waiting for server-first.
    SentFirst { client_first_bare: String },
    /// Waiting for server-final.
    SentFinal {
        salted_password: [u8; 32],
        auth_message: String,
    },
    /// Server signature verified.
    Done,
}

/// SCRAM-SHA-256 client state machine.
#[derive(Debug)]
pub struct ScramClient {
    password: String,
    client_nonce: String,
    state: State,
}

impl ScramClient {
    /// Create a client with a fresh random nonce.
    pub fn new(password: &str) -> Self {
        // 18 random bytes encode to 24 base64 chars
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(password, &BASE64.encode(nonce_bytes))
    }

    fn with_nonce(password: &str, nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            state: State::Initial,
        }
    }

    /// Build the client-first message: `n,,n=,r=<client-nonce>`.
    ///
    /// PostgreSQL takes the user from the startup packet and ignores the
    /// SCRAM user name, so it is left empty.
    pub fn client_first(&mut self) -> Vec<u8> {
        let bare = format!("n=,r={}", self.client_nonce);
        let message = format!("n,,{}", bare);
        self.state = State::SentFirst {
            client_first_bare: bare,
        };
        message.into_bytes()
    }

    /// Consume server-first (`r=<nonce>,s=<salt>,i=<iterations>`) and build
    /// the client-final message carrying the proof.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>, ScramError> {
        let client_first_bare = match &self.state {
            State::SentFirst { client_first_bare } => client_first_bare.clone(),
            _ => return Err(ScramError::InvalidState),
        };

        let server_first =
            std::str::from_utf8(server_first).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| ScramError::InvalidIterations)?,
                );
            }
        }

        let nonce = nonce.ok_or(ScramError::MissingNonce)?;
        let salt = salt.ok_or(ScramError::MissingSalt)?;
        let iterations = iterations.ok_or(ScramError::MissingIterations)?;

        // The server nonce must extend ours
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(ScramError::NonceVerificationFailed);
        }
        if iterations == 0 {
            return Err(ScramError::InvalidIterations);
        }

        let salted_password = hi(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        let without_proof = format!("c={},r={}", CHANNEL_BINDING, nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let proof = xor_bytes(&client_key, &client_signature);

        self.state = State::SentFinal {
            salted_password,
            auth_message,
        };

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check the server signature in server-final (`v=<signature>`).
    pub fn verify_server_final(&mut self, server_final: &[u8]) -> Result<(), ScramError> {
        let (salted_password, auth_message) = match &self.state {
            State::SentFinal {
                salted_password,
                auth_message,
            } => (salted_password, auth_message),
            _ => return Err(ScramError::InvalidState),
        };

        let server_final =
            std::str::from_utf8(server_final).map_err(|_| ScramError::InvalidServerMessage)?;

        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::ServerRejected(err.to_string()));
        }

        let verifier = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or(ScramError::InvalidServerSignature)?;
        let signature = BASE64
            .decode(verifier)
            .map_err(|_| ScramError::InvalidServerSignature)?;

        let server_key = hmac_sha256(salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());

        if signature != expected {
            return Err(ScramError::ServerSignatureVerificationFailed);
        }

        self.state = State::Done;
        Ok(())
    }

    /// Whether the server has been verified.
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }
}

/// SCRAM authentication errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    InvalidServerMessage,
    InvalidSalt,
    InvalidIterations,
    MissingNonce,
    MissingSalt,
    MissingIterations,
    NonceVerificationFailed,
    InvalidServerSignature,
    ServerSignatureVerificationFailed,
    ServerRejected(String),
    InvalidState,
}

impl std::fmt::Display for ScramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidServerMessage => write!(f, "Invalid server message"),
            Self::InvalidSalt => write!(f, "Invalid salt encoding"),
            Self::InvalidIterations => write!(f, "Invalid iteration count"),
            Self::MissingNonce => write!(f, "Missing nonce in server message"),
            Self::MissingSalt => write!(f, "Missing salt in server message"),
            Self::MissingIterations => write!(f, "Missing iterations in server message"),
            Self::NonceVerificationFailed => write!(f, "Server nonce verification failed"),
            Self::InvalidServerSignature => write!(f, "Invalid server signature"),
            Self::ServerSignatureVerificationFailed => {
                write!(f, "Server signature verification failed")
            }
            Self::ServerRejected(e) => write!(f, "Server rejected SCRAM exchange: {}", e),
            Self::InvalidState => write!(f, "Unexpected SCRAM message"),
        }
    }
}

impl std::error::Error for ScramError {}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi() function - PBKDF2 with HMAC-SHA-256
fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .expect("valid output length");
    output
}

/// HMAC-SHA-256
fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// SHA-256 hash
fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut result = [0u8; 32];
    for (out, (x, y)) in result.iter_mut().zip(a.iter().zip(b.iter())) {
        *out = x ^ y;
    }
    result
}

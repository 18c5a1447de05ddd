//! Ed25519 request verification and response signing.
//!
//! Signatures travel base64-encoded in HTTP headers and always cover the exact
//! bytes of a body, never a re-serialization of it.

use data_encoding::{BASE64, HEXLOWER_PERMISSIVE};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::Serialize;
use thiserror::Error;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
pub const SEED_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("signature is not valid base64")]
    SignatureEncoding,
    #[error("invalid signature length: expected 64, found {0}")]
    SignatureLength(usize),
    #[error("invalid public key length: expected 32, found {0}")]
    PublicKeyLength(usize),
    #[error("bytes do not encode a curve point")]
    PublicKey,
    #[error("signing seed must be 32 hex-encoded bytes")]
    Seed,
}

/// Decode a base64 signature, rejecting anything that is not exactly
/// [`SIGNATURE_LEN`] bytes before it reaches the curve arithmetic.
pub fn decode_signature(encoded: &str) -> Result<Signature, CryptoError> {
    let bytes = BASE64
        .decode(encoded.trim().as_bytes())
        .map_err(|_| CryptoError::SignatureEncoding)?;
    let bytes: [u8; SIGNATURE_LEN] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::SignatureLength(bytes.len()))?;
    Ok(Signature::from_bytes(&bytes))
}

/// Parse a raw public key, checking its length first.
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let bytes: &[u8; PUBLIC_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| CryptoError::PublicKeyLength(bytes.len()))?;
    VerifyingKey::from_bytes(bytes).map_err(|_| CryptoError::PublicKey)
}

/// Was `message` signed by the holder of `key`?
///
/// Uses strict verification, so malleated or small-order signatures are
/// rejected rather than accepted as equivalent.
pub fn verify(key: &VerifyingKey, message: &[u8], signature: &Signature) -> bool {
    key.verify_strict(message, signature).is_ok()
}

/// Byte-level variant of [`verify`] for callers holding undecoded material.
/// Malformed lengths are an error, not a `false`.
pub fn verify_bytes(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<bool, CryptoError> {
    let key = public_key_from_bytes(public_key)?;
    let signature: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| CryptoError::SignatureLength(signature.len()))?;
    Ok(verify(&key, message, &Signature::from_bytes(&signature)))
}

/// A response body together with the server's signature over those bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedResponse {
    pub body: Vec<u8>,
    /// Base64 signature, sent in the `VSP-Server-Signature` header.
    pub signature: String,
}

impl SignedResponse {
    /// The body as text. Bodies are always serialized JSON.
    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or_default()
    }
}

/// The server's signing identity.
#[derive(Clone)]
pub struct ServerSigner {
    key: SigningKey,
}

impl ServerSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Build a signer from a hex-encoded 32 byte seed, as stored in config.
    pub fn from_hex_seed(seed: &str) -> Result<Self, CryptoError> {
        let bytes = HEXLOWER_PERMISSIVE
            .decode(seed.trim().as_bytes())
            .map_err(|_| CryptoError::Seed)?;
        let seed: [u8; SEED_LEN] = bytes.as_slice().try_into().map_err(|_| CryptoError::Seed)?;
        Ok(Self::new(SigningKey::from_bytes(&seed)))
    }

    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    pub fn seed_hex(&self) -> String {
        HEXLOWER_PERMISSIVE.encode(&self.key.to_bytes())
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Base64 encoding of the public key, as advertised to clients.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key().as_bytes())
    }

    /// Sign arbitrary bytes, returning the base64 signature.
    pub fn sign(&self, message: &[u8]) -> String {
        BASE64.encode(&self.key.sign(message).to_bytes())
    }

    /// Serialize `value` to JSON and sign the resulting bytes.
    pub fn sign_json<T: Serialize>(&self, value: &T) -> Result<SignedResponse, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        let signature = self.sign(&body);
        Ok(SignedResponse { body, signature })
    }
}

impl std::fmt::Debug for ServerSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSigner")
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

//! # Scoped Key Module
//!
//! Encrypts and decrypts the parameter bundle carried by a scoped key.
//!
//! ## Format
//!
//! A scoped key is `hex(iv) ++ hex(ciphertext)` where the ciphertext is the JSON
//! parameter object encrypted with AES-256-CBC (PKCS#7 padding) under a 32-byte
//! secret, and `iv` is 16 random bytes drawn for every encryption. This is the
//! format the upstream analytics API uses for its own scoped keys, so a key
//! minted here under the master secret is accepted upstream as-is.
//!
//! Because the IV is fresh on every call, encoding the same parameters twice
//! never produces the same key.
//!
//! ## Secrets
//!
//! - **Public secret**: shared with key-issuing tooling, used to decode inbound keys
//! - **Master secret**: known only to the proxy, used to mint the upstream key

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::RngCore;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

use crate::filters::{self, Filter};

/// Required secret length in bytes (AES-256 key size)
pub const SECRET_LEN: usize = 32;

const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

pub const ALLOWED_OPERATIONS: &str = "allowed_operations";
pub const ANALYSIS_TYPE: &str = "analysisType";
pub const FILTERS: &str = "filters";

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Errors that can occur while handling scoped keys
#[derive(Debug, Clone, PartialEq)]
pub enum TokenError {
    /// The secret is not usable as an AES-256 key
    InvalidSecret(String),
    /// The key is not hex or not a whole number of cipher blocks
    Malformed(&'static str),
    /// Padding check failed, almost always a secret mismatch
    Decryption,
    /// Decrypted content is not a valid parameter object
    InvalidPayload(String),
    Encryption(String),
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::InvalidSecret(msg) => write!(f, "Invalid secret: {}", msg),
            TokenError::Malformed(msg) => write!(f, "Malformed scoped key: {}", msg),
            TokenError::Decryption => write!(f, "Unable to decrypt scoped key"),
            TokenError::InvalidPayload(msg) => write!(f, "Invalid scoped key payload: {}", msg),
            TokenError::Encryption(msg) => write!(f, "Unable to encrypt scoped key: {}", msg),
        }
    }
}

impl std::error::Error for TokenError {}

/// A 32-byte shared secret used as the AES-256 key
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSecret([u8; SECRET_LEN]);

impl TokenSecret {
    pub fn new(secret: &str) -> Result<Self, TokenError> {
        let bytes: [u8; SECRET_LEN] = secret.as_bytes().try_into().map_err(|_| {
            TokenError::InvalidSecret(format!(
                "expected {} bytes, got {}",
                SECRET_LEN,
                secret.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Generate a random secret as 32 lowercase hex characters
    pub fn generate() -> (Self, String) {
        let mut raw = [0u8; SECRET_LEN / 2];
        rand::thread_rng().fill_bytes(&mut raw);
        let text = hex::encode(raw);
        let mut bytes = [0u8; SECRET_LEN];
        bytes.copy_from_slice(text.as_bytes());
        (Self(bytes), text)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenSecret(**redacted**)")
    }
}

/// Decrypted contents of a scoped key
///
/// The full parameter object is kept so it can be re-encrypted verbatim;
/// the well-known fields are validated and exposed through typed accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedTokenParams {
    params: Map<String, Value>,
    allowed_operations: Vec<String>,
    analysis_type: Option<String>,
    filters: Option<Vec<Filter>>,
}

impl ScopedTokenParams {
    /// Create parameters granting the given operations and nothing else
    pub fn new<I, S>(allowed_operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed_operations: Vec<String> =
            allowed_operations.into_iter().map(Into::into).collect();
        let mut params = Map::new();
        params.insert(
            ALLOWED_OPERATIONS.to_string(),
            Value::Array(
                allowed_operations
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect(),
            ),
        );

        Self {
            params,
            allowed_operations,
            analysis_type: None,
            filters: None,
        }
    }

    /// Validate a decoded parameter object
    pub fn from_map(params: Map<String, Value>) -> Result<Self, TokenError> {
        let allowed_operations = match params.get(ALLOWED_OPERATIONS) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(operation) => Ok(operation.clone()),
                    _ => Err(TokenError::InvalidPayload(
                        "allowed_operations must only contain strings".to_string(),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(TokenError::InvalidPayload(
                    "allowed_operations must be an array".to_string(),
                ));
            }
            None => {
                return Err(TokenError::InvalidPayload(
                    "missing allowed_operations".to_string(),
                ));
            }
        };

        let analysis_type = match params.get(ANALYSIS_TYPE) {
            Some(Value::String(analysis_type)) => Some(analysis_type.clone()),
            Some(_) => {
                return Err(TokenError::InvalidPayload(
                    "analysisType must be a string".to_string(),
                ));
            }
            None => None,
        };

        let filters = match params.get(FILTERS) {
            Some(value) => Some(
                filters::filters_from_value(value.clone())
                    .map_err(|e| TokenError::InvalidPayload(e.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            params,
            allowed_operations,
            analysis_type,
            filters,
        })
    }

    pub fn with_analysis_type(mut self, analysis_type: &str) -> Self {
        self.params.insert(
            ANALYSIS_TYPE.to_string(),
            Value::String(analysis_type.to_string()),
        );
        self.analysis_type = Some(analysis_type.to_string());
        self
    }

    pub fn with_filters(mut self, filters: Vec<Filter>) -> Self {
        self.params.insert(
            FILTERS.to_string(),
            Value::Array(filters.iter().map(Filter::to_value).collect()),
        );
        self.filters = Some(filters);
        self
    }

    /// Add an arbitrary query parameter, re-validating the well-known fields
    pub fn with_param(self, key: &str, value: Value) -> Result<Self, TokenError> {
        let mut params = self.params;
        params.insert(key.to_string(), value);
        Self::from_map(params)
    }

    pub fn allowed_operations(&self) -> &[String] {
        &self.allowed_operations
    }

    pub fn analysis_type(&self) -> Option<&str> {
        self.analysis_type.as_deref()
    }

    /// Filter restrictions, `None` when the key establishes none
    pub fn filters(&self) -> Option<&[Filter]> {
        self.filters.as_deref()
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Every parameter except `filters`, which gets merged rather than overwritten
    pub fn overrides(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.params.iter().filter(|(key, _)| key.as_str() != FILTERS)
    }
}

impl Serialize for ScopedTokenParams {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.params.serialize(serializer)
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Decrypt and validate a scoped key
pub fn decode(secret: &TokenSecret, token: &str) -> Result<ScopedTokenParams, TokenError> {
    let raw = hex::decode(token.trim())
        .map_err(|_| TokenError::Malformed("scoped key is not valid hex"))?;

    if raw.len() < IV_LEN + BLOCK_LEN || (raw.len() - IV_LEN) % BLOCK_LEN != 0 {
        return Err(TokenError::Malformed(
            "scoped key is not a whole number of cipher blocks",
        ));
    }

    let (iv, ciphertext) = raw.split_at(IV_LEN);
    let plaintext = Aes256CbcDec::new_from_slices(secret.as_bytes(), iv)
        .map_err(|e| TokenError::InvalidSecret(e.to_string()))?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| TokenError::Decryption)?;

    let payload: Value = serde_json::from_slice(&plaintext)
        .map_err(|e| TokenError::InvalidPayload(format!("not JSON: {}", e)))?;

    match payload {
        Value::Object(params) => ScopedTokenParams::from_map(params),
        _ => Err(TokenError::InvalidPayload(
            "payload is not a JSON object".to_string(),
        )),
    }
}

/// Encrypt parameters into a new scoped key under a fresh IV
pub fn encode(secret: &TokenSecret, params: &ScopedTokenParams) -> Result<String, TokenError> {
    let plaintext =
        serde_json::to_vec(params.params()).map_err(|e| TokenError::Encryption(e.to_string()))?;

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new_from_slices(secret.as_bytes(), &iv)
        .map_err(|e| TokenError::InvalidSecret(e.to_string()))?
        .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

    Ok(format!("{}{}", hex::encode(iv), hex::encode(ciphertext)))
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////

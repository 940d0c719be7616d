//! Key material and request signing used to authenticate the notification handshake.
//!
//! The socket handshake carries no application payload, so [`Authenticator`] always signs the
//! constant [`HANDSHAKE_BODY`] together with the agent identity and the manifest fingerprint.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signer as _, SigningKey};
/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest as _, Sha256};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use uuid::Uuid;

use crate::error::Error;
use crate::{Result, Timestamp};

pub const CLAW_AGENT_ID: &str = "x-claw-agent-id";
pub const CLAW_TIMESTAMP: &str = "x-claw-timestamp";
pub const CLAW_NONCE: &str = "x-claw-nonce";
pub const CLAW_SIGNATURE: &str = "x-claw-signature";
pub const CLAW_MANIFEST_HASH: &str = "x-claw-manifest-hash";

/// Payload signed during the WebSocket handshake: the empty JSON object.
pub const HANDSHAKE_BODY: &str = "{}";

/// Source of the agent's identity and private key.
///
/// Either value may be absent when the agent has not been provisioned yet; connecting in that
/// state fails with a [`crate::error::Kind::Configuration`] error.
#[async_trait]
pub trait KeyStore: Send + Sync + 'static {
    /// Hex-encoded Ed25519 private key seed, if one has been stored.
    async fn private_key(&self) -> Result<Option<SecretString>>;

    /// The platform-assigned agent identifier, if one has been stored.
    async fn agent_id(&self) -> Result<Option<String>>;
}

/// Produces the header set proving that `agent_id` authored `body`.
pub trait HeaderSigner: Send + Sync + 'static {
    fn sign_headers(
        &self,
        body: &str,
        agent_id: &str,
        private_key: &SecretString,
        manifest_hash: &str,
    ) -> Result<HeaderMap>;
}

/// In-memory [`KeyStore`]. Keys live only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    agent_id: RwLock<Option<String>>,
    private_key: RwLock<Option<SecretString>>,
}

impl MemoryKeyStore {
    /// An empty store. Connecting with it fails until keys are set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_keys<S: Into<String>>(agent_id: S, private_key: SecretString) -> Self {
        Self {
            agent_id: RwLock::new(Some(agent_id.into())),
            private_key: RwLock::new(Some(private_key)),
        }
    }

    /// Creates a store holding a freshly generated Ed25519 key for `agent_id`.
    #[must_use]
    pub fn generate<S: Into<String>>(agent_id: S) -> Self {
        let seed: [u8; 32] = rand::random();
        Self::with_keys(agent_id, SecretString::from(hex::encode(seed)))
    }

    pub fn set_keys<S: Into<String>>(&self, agent_id: S, private_key: SecretString) {
        // Both slots are plain values, a poisoned lock holds nothing half-written.
        *self
            .agent_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(agent_id.into());
        *self
            .private_key
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(private_key);
    }

    pub fn clear(&self) {
        *self
            .agent_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        *self
            .private_key
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn private_key(&self) -> Result<Option<SecretString>> {
        Ok(self
            .private_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn agent_id(&self) -> Result<Option<String>> {
        Ok(self
            .agent_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Ed25519 [`HeaderSigner`] producing the `X-Claw-*` header set.
///
/// The signed message is `"{timestamp}:{nonce}:{sha256_hex(body)}"`, where `timestamp` is in
/// seconds since the Unix epoch and `nonce` is a random UUID.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default)]
pub struct ClawSigner;

impl ClawSigner {
    /// Hex-encoded public key matching `private_key`.
    pub fn public_key_hex(private_key: &SecretString) -> Result<String> {
        let signing_key = signing_key(private_key)?;
        Ok(hex::encode(signing_key.verifying_key().to_bytes()))
    }

    fn sign_at(
        body: &str,
        agent_id: &str,
        private_key: &SecretString,
        manifest_hash: &str,
        timestamp: Timestamp,
        nonce: Uuid,
    ) -> Result<HeaderMap> {
        let signing_key = signing_key(private_key)?;
        let message = to_message(body, timestamp, nonce);
        let signature = signing_key.sign(message.as_bytes());

        let mut map = HeaderMap::new();
        map.insert(CLAW_AGENT_ID, agent_id.parse()?);
        map.insert(CLAW_TIMESTAMP, timestamp.to_string().parse()?);
        map.insert(CLAW_NONCE, nonce.to_string().parse()?);
        map.insert(
            CLAW_SIGNATURE,
            STANDARD.encode(signature.to_bytes()).parse()?,
        );
        map.insert(CLAW_MANIFEST_HASH, manifest_hash.parse()?);

        Ok(map)
    }
}

impl HeaderSigner for ClawSigner {
    fn sign_headers(
        &self,
        body: &str,
        agent_id: &str,
        private_key: &SecretString,
        manifest_hash: &str,
    ) -> Result<HeaderMap> {
        let timestamp = chrono::Utc::now().timestamp();
        Self::sign_at(
            body,
            agent_id,
            private_key,
            manifest_hash,
            timestamp,
            Uuid::new_v4(),
        )
    }
}

/// Bundles everything needed to authenticate the handshake: where the keys come from, how they
/// sign, and the manifest fingerprint the platform expects.
#[derive(Clone)]
pub struct Authenticator {
    key_store: Arc<dyn KeyStore>,
    signer: Arc<dyn HeaderSigner>,
    manifest_hash: String,
}

impl Authenticator {
    /// Uses [`ClawSigner`] to sign.
    pub fn new<S: Into<String>>(key_store: Arc<dyn KeyStore>, manifest_hash: S) -> Self {
        Self {
            key_store,
            signer: Arc::new(ClawSigner),
            manifest_hash: manifest_hash.into(),
        }
    }

    #[must_use]
    pub fn with_signer(mut self, signer: Arc<dyn HeaderSigner>) -> Self {
        self.signer = signer;
        self
    }

    #[must_use]
    pub fn manifest_hash(&self) -> &str {
        &self.manifest_hash
    }

    /// Returns the headers to attach to the upgrade request.
    ///
    /// Fails with [`crate::error::Kind::Configuration`] when the key store has no key or no
    /// agent identity.
    pub async fn handshake_headers(&self) -> Result<HeaderMap> {
        let private_key = self.key_store.private_key().await?;
        let agent_id = self.key_store.agent_id().await?;

        let (Some(private_key), Some(agent_id)) = (private_key, agent_id) else {
            return Err(Error::configuration(
                "No keys stored. Generate or store keys before connecting",
            ));
        };

        self.signer.sign_headers(
            HANDSHAKE_BODY,
            &agent_id,
            &private_key,
            &self.manifest_hash,
        )
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("manifest_hash", &self.manifest_hash)
            .finish_non_exhaustive()
    }
}

fn signing_key(private_key: &SecretString) -> Result<SigningKey> {
    let raw = private_key.expose_secret();
    let bytes = hex::decode(raw.strip_prefix("0x").unwrap_or(raw))?;
    let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_e| {
        Error::validation(format!(
            "private key must be 32 bytes, got {}",
            bytes.len()
        ))
    })?;

    Ok(SigningKey::from_bytes(&seed))
}

fn to_message(body: &str, timestamp: Timestamp, nonce: Uuid) -> String {
    let body_hash = hex::encode(Sha256::digest(body.as_bytes()));
    format!("{timestamp}:{nonce}:{body_hash}")
}

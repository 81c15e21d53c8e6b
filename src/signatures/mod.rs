//! Signing and verifying federation traffic
//!
//! Two HTTP signature suites are supported: the draft-cavage-12 scheme
//! most fediverse software still speaks ([cavage]) and RFC 9421 HTTP
//! Message Signatures ([rfc9421]). Outgoing requests negotiate the suite
//! per remote origin by double-knocking ([double_knock]).

pub mod cavage;
pub mod double_knock;
pub mod rfc9421;

use crate::error::Error;
use crate::fetch::loader::DocumentLoader;
use crate::kv::{KvKey, KvStore};
use crate::vocab::actor::Actor;
use crate::vocab::PublicKey;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::pkcs8::{DecodePublicKey as _, EncodePrivateKey as _, EncodePublicKey as _};
use ed25519_dalek::Verifier as _;
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey as _, DecodeRsaPublicKey as _};
use rsa::pkcs8::{DecodePrivateKey as _, LineEnding};
use rsa::traits::PublicKeyParts as _;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Minimum RSA modulus size in bits; smaller keys fail at import.
const MIN_RSA_BITS: usize = 2048;

/// Accepted signature algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// RSASSA-PKCS1-v1_5 over SHA-256 (`rsa-v1_5-sha256`)
    RsaSha256,
    /// Ed25519
    Ed25519,
}

impl SignatureAlgorithm {
    /// The RFC 9421 algorithm name.
    pub fn rfc9421_name(self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha256 => "rsa-v1_5-sha256",
            SignatureAlgorithm::Ed25519 => "ed25519",
        }
    }

    /// The draft-cavage algorithm name.
    pub fn cavage_name(self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha256 => "rsa-sha256",
            SignatureAlgorithm::Ed25519 => "ed25519",
        }
    }

    pub(crate) fn from_any_name(name: &str) -> Option<SignatureAlgorithm> {
        match name {
            "rsa-v1_5-sha256" | "rsa-sha256" | "hs2019" => Some(SignatureAlgorithm::RsaSha256),
            "ed25519" => Some(SignatureAlgorithm::Ed25519),
            _ => None,
        }
    }
}

/// A private key usable for signing requests.
#[derive(Clone)]
pub enum SigningKey {
    /// RSA private key
    Rsa(Box<RsaPrivateKey>),
    /// Ed25519 private key
    Ed25519(Box<ed25519_dalek::SigningKey>),
}

impl SigningKey {
    /// Imports a PEM private key (PKCS#8, or the legacy PKCS#1 RSA form).
    pub fn from_pem(pem: &str) -> Result<SigningKey, Error> {
        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
            check_rsa_size(key.to_public_key().size())?;
            return Ok(SigningKey::Rsa(Box::new(key)));
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
            check_rsa_size(key.to_public_key().size())?;
            return Ok(SigningKey::Rsa(Box::new(key)));
        }
        if let Ok(key) = ed25519_dalek::SigningKey::from_pkcs8_pem(pem) {
            return Ok(SigningKey::Ed25519(Box::new(key)));
        }
        Err(Error::Signature("unsupported private key format"))
    }

    /// The key's algorithm.
    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            SigningKey::Rsa(_) => SignatureAlgorithm::RsaSha256,
            SigningKey::Ed25519(_) => SignatureAlgorithm::Ed25519,
        }
    }

    /// Exports the key as PKCS#8 PEM.
    pub fn to_pem(&self) -> Result<String, Error> {
        let pem = match self {
            SigningKey::Rsa(key) => {
                rsa::pkcs8::EncodePrivateKey::to_pkcs8_pem(key.as_ref(), LineEnding::LF)
                    .map_err(|e| Error::Other(format!("key export failed: {e}")))?
            }
            SigningKey::Ed25519(key) => key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| Error::Other(format!("key export failed: {e}")))?,
        };
        Ok(pem.to_string())
    }

    /// The corresponding public key.
    pub fn verify_key(&self) -> VerifyKey {
        match self {
            SigningKey::Rsa(key) => VerifyKey::Rsa(Box::new(key.to_public_key())),
            SigningKey::Ed25519(key) => VerifyKey::Ed25519(Box::new(key.verifying_key())),
        }
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            SigningKey::Rsa(key) => {
                let digest = Sha256::digest(message);
                key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
                    .map_err(|e| Error::Other(format!("RSA signing failed: {e}")))
            }
            SigningKey::Ed25519(key) => {
                use ed25519_dalek::Signer as _;
                Ok(key.sign(message).to_bytes().to_vec())
            }
        }
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningKey::Rsa(_) => write!(f, "SigningKey::Rsa"),
            SigningKey::Ed25519(_) => write!(f, "SigningKey::Ed25519"),
        }
    }
}

/// A public key usable for verifying signatures.
#[derive(Clone, Debug)]
pub enum VerifyKey {
    /// RSA public key
    Rsa(Box<RsaPublicKey>),
    /// Ed25519 public key
    Ed25519(Box<ed25519_dalek::VerifyingKey>),
}

impl VerifyKey {
    /// Imports a PEM public key (SPKI, or the legacy PKCS#1 RSA form).
    pub fn from_pem(pem: &str) -> Result<VerifyKey, Error> {
        if let Ok(key) = RsaPublicKey::from_public_key_pem(pem) {
            check_rsa_size(key.size())?;
            return Ok(VerifyKey::Rsa(Box::new(key)));
        }
        if let Ok(key) = RsaPublicKey::from_pkcs1_pem(pem) {
            check_rsa_size(key.size())?;
            return Ok(VerifyKey::Rsa(Box::new(key)));
        }
        if let Ok(key) = ed25519_dalek::VerifyingKey::from_public_key_pem(pem) {
            return Ok(VerifyKey::Ed25519(Box::new(key)));
        }
        Err(Error::Signature("unsupported public key format"))
    }

    /// Exports the key as SPKI PEM.
    pub fn to_pem(&self) -> Result<String, Error> {
        match self {
            VerifyKey::Rsa(key) => key
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| Error::Other(format!("key export failed: {e}"))),
            VerifyKey::Ed25519(key) => key
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| Error::Other(format!("key export failed: {e}"))),
        }
    }

    /// The key's algorithm.
    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            VerifyKey::Rsa(_) => SignatureAlgorithm::RsaSha256,
            VerifyKey::Ed25519(_) => SignatureAlgorithm::Ed25519,
        }
    }

    pub(crate) fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match self {
            VerifyKey::Rsa(key) => {
                let digest = Sha256::digest(message);
                key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
                    .is_ok()
            }
            VerifyKey::Ed25519(key) => match ed25519_dalek::Signature::from_slice(signature) {
                Ok(signature) => key.verify(message, &signature).is_ok(),
                Err(_) => false,
            },
        }
    }
}

fn check_rsa_size(size_bytes: usize) -> Result<(), Error> {
    if size_bytes * 8 < MIN_RSA_BITS {
        return Err(Error::Signature("RSA keys must be at least 2048 bits"));
    }
    Ok(())
}

/// A private/public key pair in PEM form.
#[derive(Clone, Debug)]
pub struct Keypair {
    /// PKCS#8 PEM private key
    pub private_key: String,
    /// SPKI PEM public key
    pub public_key: String,
}

/// Generates a fresh 2048-bit RSA keypair.
pub fn generate_actor_keypair() -> Result<Keypair, Error> {
    let key = RsaPrivateKey::new(&mut OsRng, MIN_RSA_BITS)
        .map_err(|e| Error::Other(format!("key generation failed: {e}")))?;
    let private_key = rsa::pkcs8::EncodePrivateKey::to_pkcs8_pem(&key, LineEnding::LF)
        .map_err(|e| Error::Other(format!("key export failed: {e}")))?
        .to_string();
    let public_key = key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::Other(format!("key export failed: {e}")))?;
    Ok(Keypair {
        private_key,
        public_key,
    })
}

/// Generates a fresh Ed25519 keypair.
pub fn generate_ed25519_keypair() -> Result<Keypair, Error> {
    let key = ed25519_dalek::SigningKey::generate(&mut OsRng);
    let private_key = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Other(format!("key export failed: {e}")))?
        .to_string();
    let public_key = key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::Other(format!("key export failed: {e}")))?;
    Ok(Keypair {
        private_key,
        public_key,
    })
}

/// A key returned by successful verification: the public key together
/// with its id and the controlling actor.
#[derive(Clone, Debug)]
pub struct FetchedKey {
    /// The key's id as referenced in signatures
    pub key_id: Url,
    /// The actor controlling the key, when known
    pub owner: Option<Url>,
    /// The public key itself
    pub key: VerifyKey,
}

/// Resolves a `keyId` to a public key.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    /// Returns the key, or `None` when it cannot be found.
    async fn resolve(&self, key_id: &Url) -> Result<Option<FetchedKey>, Error>;
}

#[derive(Serialize, Deserialize)]
struct CachedKey {
    pem: String,
    owner: Option<Url>,
}

/// [KeyResolver] that checks the key-value store first and falls back to
/// fetching the key document, writing the result back through.
pub struct CachingKeyResolver {
    loader: Arc<dyn DocumentLoader>,
    kv: Arc<dyn KvStore>,
    prefix: KvKey,
}

impl CachingKeyResolver {
    /// Creates a resolver storing keys under `[prefix..., "publicKey", keyId]`.
    pub fn new(
        loader: Arc<dyn DocumentLoader>,
        kv: Arc<dyn KvStore>,
        prefix: KvKey,
    ) -> CachingKeyResolver {
        CachingKeyResolver {
            loader,
            kv,
            prefix: prefix.with("publicKey"),
        }
    }

    async fn fetch(&self, key_id: &Url) -> Result<Option<FetchedKey>, Error> {
        let document = self.loader.load(key_id).await?;

        // A bare key document.
        if let Ok(key) = serde_json::from_value::<PublicKey>(document.document.clone()) {
            return Ok(Some(FetchedKey {
                key_id: key.id.clone(),
                owner: Some(key.owner.clone()),
                key: VerifyKey::from_pem(&key.public_key_pem)?,
            }));
        }

        // An actor document carrying its keys.
        let actor = Actor::from_json_ld(&document.document)?;
        let Some(key) = actor.key_by_id(key_id) else {
            debug!("Actor {:?} does not carry key {key_id}", actor.id);
            return Ok(None);
        };
        Ok(Some(FetchedKey {
            key_id: key.id.clone(),
            owner: Some(key.owner.clone()),
            key: VerifyKey::from_pem(&key.public_key_pem)?,
        }))
    }
}

#[async_trait]
impl KeyResolver for CachingKeyResolver {
    async fn resolve(&self, key_id: &Url) -> Result<Option<FetchedKey>, Error> {
        let cache_key = self.prefix.with(key_id.as_str());
        if let Ok(Some(value)) = self.kv.get(&cache_key).await {
            if let Ok(cached) = serde_json::from_value::<CachedKey>(value) {
                if let Ok(key) = VerifyKey::from_pem(&cached.pem) {
                    return Ok(Some(FetchedKey {
                        key_id: key_id.clone(),
                        owner: cached.owner,
                        key,
                    }));
                }
            }
        }

        let Some(fetched) = self.fetch(key_id).await? else {
            return Ok(None);
        };
        let cached = CachedKey {
            pem: fetched.key.to_pem()?,
            owner: fetched.owner.clone(),
        };
        // Write-through; a failed write only costs a refetch.
        if let Err(error) = self
            .kv
            .set(&cache_key, serde_json::to_value(&cached)?, None)
            .await
        {
            debug!("Failed to cache key {key_id}: {error}");
        }
        Ok(Some(fetched))
    }
}

/// Acceptance window for signature timestamps.
#[derive(Clone, Copy, Debug, Default)]
pub enum TimeWindow {
    /// ±1 hour around the signature's creation instant
    #[default]
    Default,
    /// No timestamp checking
    Disabled,
    /// A custom maximum skew in either direction
    Max(Duration),
}

impl TimeWindow {
    pub(crate) fn tolerates(self, created: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let max = match self {
            TimeWindow::Default => Duration::hours(1),
            TimeWindow::Disabled => return true,
            TimeWindow::Max(max) => max,
        };
        let skew = if now >= created { now - created } else { created - now };
        skew <= max
    }
}

/// Options for signature verification.
#[derive(Clone, Debug, Default)]
pub struct VerifyOptions {
    /// Verification instant; defaults to the wall clock
    pub current_time: Option<DateTime<Utc>>,
    /// Timestamp acceptance window
    pub time_window: TimeWindow,
}

impl VerifyOptions {
    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.current_time.unwrap_or_else(Utc::now)
    }
}

/// The signature suite a request is signed under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureSpec {
    /// draft-cavage-http-signatures-12
    Cavage,
    /// RFC 9421 HTTP Message Signatures
    Rfc9421,
}

impl SignatureSpec {
    /// The other suite, used for the second knock.
    pub fn other(self) -> SignatureSpec {
        match self {
            SignatureSpec::Cavage => SignatureSpec::Rfc9421,
            SignatureSpec::Rfc9421 => SignatureSpec::Cavage,
        }
    }

    pub(crate) fn wire_name(self) -> &'static str {
        match self {
            SignatureSpec::Cavage => "draft-cavage-http-signatures-12",
            SignatureSpec::Rfc9421 => "rfc9421",
        }
    }

    pub(crate) fn from_wire_name(name: &str) -> Option<SignatureSpec> {
        match name {
            "draft-cavage-http-signatures-12" => Some(SignatureSpec::Cavage),
            "rfc9421" => Some(SignatureSpec::Rfc9421),
            _ => None,
        }
    }
}

impl Default for SignatureSpec {
    fn default() -> Self {
        SignatureSpec::Rfc9421
    }
}

/// Remembers which signature suite a remote origin accepts.
#[async_trait]
pub trait SpecDeterminer: Send + Sync {
    /// The remembered suite for `origin`, if any.
    async fn determine(&self, origin: &str) -> Option<SignatureSpec>;

    /// Records the suite that succeeded against `origin`.
    async fn remember(&self, origin: &str, spec: SignatureSpec);
}

/// [SpecDeterminer] backed by the key-value store, under
/// `[prefix..., "httpSigSpec", origin]`.
pub struct KvSpecDeterminer {
    kv: Arc<dyn KvStore>,
    prefix: KvKey,
}

impl KvSpecDeterminer {
    /// Creates a determiner.
    pub fn new(kv: Arc<dyn KvStore>, prefix: KvKey) -> KvSpecDeterminer {
        KvSpecDeterminer {
            kv,
            prefix: prefix.with("httpSigSpec"),
        }
    }
}

#[async_trait]
impl SpecDeterminer for KvSpecDeterminer {
    async fn determine(&self, origin: &str) -> Option<SignatureSpec> {
        let value = self.kv.get(&self.prefix.with(origin)).await.ok()??;
        value.as_str().and_then(SignatureSpec::from_wire_name)
    }

    async fn remember(&self, origin: &str, spec: SignatureSpec) {
        // Last-writer-wins is fine here; a stale entry only costs one
        // extra knock.
        if let Err(error) = self
            .kv
            .set(&self.prefix.with(origin), json!(spec.wire_name()), None)
            .await
        {
            debug!("Failed to remember signature spec for {origin}: {error}");
        }
    }
}

/// Computes the base64 SHA-256 of a body.
pub(crate) fn sha256_base64(body: &[u8]) -> String {
    Base64.encode(Sha256::digest(body))
}

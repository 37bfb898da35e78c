// VAPID for Web Push: https://www.rfc-editor.org/rfc/rfc8292
// The JWT is ES256 over P-256 with the signature in raw r||s form, not DER.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use base64::{engine::general_purpose, Engine};
use log::{info, warn};
use openssl::bn::BigNumContext;
use openssl::ec::{EcGroup, EcKey, PointConversionForm};
use openssl::ecdsa::EcdsaSig;
use openssl::nid::Nid;
use openssl::pkey::Private;
use openssl::sha::sha256;
use reqwest::Url;
use serde_json::json;

use crate::error::{ReminderError, Result};

/// Push services reject tokens valid for more than 24 hours.
const TOKEN_LIFETIME_S: i64 = 12 * 60 * 60;
/// Re-sign when a cached token has less than this left.
const TOKEN_REFRESH_MARGIN_S: i64 = 60 * 60;

struct CachedToken {
    jwt: String,
    expires_at: i64,
}

pub struct VapidSigner {
    key: EcKey<Private>,
    public_key: String,
    subject: String,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl VapidSigner {
    pub fn from_pem(pem: &[u8], subject: &str) -> Result<Self> {
        let key = EcKey::private_key_from_pem(pem)?;
        Self::from_key(key, subject)
    }

    pub fn from_pem_file(path: &Path, subject: &str) -> Result<Self> {
        let pem = fs::read(path)
            .map_err(|e| ReminderError::Config(format!("failed to read VAPID key {}: {e}", path.display())))?;
        Self::from_pem(&pem, subject)
    }

    /// Loads the key at `path`, creating and saving a new one if the file does
    /// not exist yet.
    pub fn load_or_generate(path: &Path, subject: &str) -> Result<Self> {
        if path.exists() {
            return Self::from_pem_file(path, subject);
        }
        let signer = Self::generate(subject)?;
        let pem = signer.key.private_key_to_pem()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| ReminderError::Config(format!("failed to create {}: {e}", parent.display())))?;
        }
        fs::write(path, pem)
            .map_err(|e| ReminderError::Config(format!("failed to write VAPID key {}: {e}", path.display())))?;
        info!("Generated new VAPID key at {}", path.display());
        Ok(signer)
    }

    pub fn generate(subject: &str) -> Result<Self> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        Self::from_key(EcKey::generate(&group)?, subject)
    }

    fn from_key(key: EcKey<Private>, subject: &str) -> Result<Self> {
        key.check_key()?;
        if key.group().curve_name() != Some(Nid::X9_62_PRIME256V1) {
            return Err(ReminderError::Config("VAPID key must be on the P-256 curve".into()));
        }
        if !subject.starts_with("mailto:") && !subject.starts_with("https://") {
            warn!("VAPID subject '{subject}' is neither mailto: nor https:, push services may reject it");
        }

        let mut ctx = BigNumContext::new()?;
        let point = key
            .public_key()
            .to_bytes(key.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)?;

        Ok(Self {
            public_key: general_purpose::URL_SAFE_NO_PAD.encode(point),
            key,
            subject: subject.to_string(),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Uncompressed public point, base64url. Clients pass it as the
    /// application server key when subscribing.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// `Authorization` header value for a push to `endpoint`.
    pub fn authorization(&self, endpoint: &str, now_secs: i64) -> Result<String> {
        let audience = audience_of(endpoint)?;
        let mut tokens = match self.tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let reusable = tokens
            .get(&audience)
            .filter(|cached| cached.expires_at - now_secs > TOKEN_REFRESH_MARGIN_S)
            .map(|cached| cached.jwt.clone());
        let jwt = match reusable {
            Some(jwt) => jwt,
            None => {
                let expires_at = now_secs + TOKEN_LIFETIME_S;
                let jwt = self.sign_jwt(&audience, expires_at)?;
                tokens.insert(
                    audience,
                    CachedToken {
                        jwt: jwt.clone(),
                        expires_at,
                    },
                );
                jwt
            }
        };
        Ok(format!("vapid t={jwt}, k={}", self.public_key))
    }

    fn sign_jwt(&self, audience: &str, expires_at: i64) -> Result<String> {
        let header = general_purpose::URL_SAFE_NO_PAD.encode(json!({ "typ": "JWT", "alg": "ES256" }).to_string());
        let claims = general_purpose::URL_SAFE_NO_PAD.encode(
            json!({ "aud": audience, "exp": expires_at, "sub": self.subject }).to_string(),
        );
        let signing_input = format!("{header}.{claims}");

        let signature = EcdsaSig::sign(&sha256(signing_input.as_bytes()), &self.key)?;
        let mut raw = signature.r().to_vec_padded(32)?;
        raw.extend(signature.s().to_vec_padded(32)?);

        Ok(format!("{signing_input}.{}", general_purpose::URL_SAFE_NO_PAD.encode(raw)))
    }
}

fn audience_of(endpoint: &str) -> Result<String> {
    let url = Url::parse(endpoint).map_err(|e| ReminderError::Push(format!("invalid endpoint: {e}")))?;
    if url.host_str().is_none() {
        return Err(ReminderError::Push("endpoint has no host".into()));
    }
    Ok(url.origin().ascii_serialization())
}

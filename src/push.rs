// Web Push delivery.
// Message encryption: https://www.rfc-editor.org/rfc/rfc8291 (aes128gcm, RFC 8188 framing)
// Authorization: see vapid.rs

use base64::{engine::general_purpose, Engine};
use log::{debug, warn};
use openssl::bn::BigNumContext;
use openssl::derive::Deriver;
use openssl::ec::{EcGroup, EcKey, EcPoint, PointConversionForm};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rand::rand_bytes;
use openssl::sign::Signer;
use openssl::symm::{encrypt_aead, Cipher};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, StatusCode};

use crate::alert::Alert;
use crate::error::{ReminderError, Result};
use crate::models::{PushKeys, PushPayload, PushSubscription};
use crate::util::get_short_token;
use crate::vapid::VapidSigner;

pub const DEFAULT_TTL_S: u32 = 60 * 60;

const RECORD_SIZE: u32 = 4096;
const SALT_LEN: usize = 16;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const PUBLIC_KEY_LEN: usize = 65;
/// Single-record messages end with this delimiter before the tag.
const LAST_RECORD_DELIMITER: u8 = 0x02;

impl From<&Alert> for PushPayload {
    fn from(alert: &Alert) -> Self {
        PushPayload {
            title: alert.title(),
            body: alert.body(),
            tag: format!("medication-{}", alert.medication_id),
            medication_id: alert.medication_id.clone(),
            scheduled_time: alert.scheduled_time.format("%H:%M").to_string(),
        }
    }
}

pub struct PushSender {
    client: Client,
    vapid: VapidSigner,
    ttl: u32,
}

impl PushSender {
    pub fn new(vapid: VapidSigner) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            vapid,
            ttl: DEFAULT_TTL_S,
        })
    }

    pub fn public_key(&self) -> &str {
        self.vapid.public_key()
    }

    pub async fn send(&self, subscription: &PushSubscription, payload: &PushPayload, now_secs: i64) -> Result<()> {
        let body = encrypt_payload(&subscription.keys, &serde_json::to_vec(payload)?)?;
        let short_endpoint = get_short_token(&subscription.endpoint);

        let mut headers = HeaderMap::new();
        let auth = self.vapid.authorization(&subscription.endpoint, now_secs)?;
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).map_err(|e| ReminderError::Push(e.to_string()))?,
        );
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("aes128gcm"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        headers.insert("TTL", HeaderValue::from(self.ttl));
        headers.insert("Urgency", HeaderValue::from_static("high"));

        let response = self
            .client
            .post(&subscription.endpoint)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!("Push accepted for endpoint ...{short_endpoint}: {status}");
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            warn!("Push subscription ...{short_endpoint} is gone ({status})");
            return Err(ReminderError::SubscriptionGone);
        }
        let text = response.text().await.unwrap_or_default();
        Err(ReminderError::Push(format!("{status} {text}")))
    }
}

/// Encrypts `plaintext` for the subscriber as a single aes128gcm record.
pub fn encrypt_payload(keys: &PushKeys, plaintext: &[u8]) -> Result<Vec<u8>> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let sender_key = EcKey::generate(&group)?;
    let mut salt = [0u8; SALT_LEN];
    rand_bytes(&mut salt)?;
    encrypt_with(keys, plaintext, sender_key, salt)
}

fn encrypt_with(keys: &PushKeys, plaintext: &[u8], sender_key: EcKey<Private>, salt: [u8; SALT_LEN]) -> Result<Vec<u8>> {
    if plaintext.len() + 1 + TAG_LEN > RECORD_SIZE as usize {
        return Err(ReminderError::Push(format!("payload of {} bytes does not fit one record", plaintext.len())));
    }

    let receiver_public = decode_key(&keys.p256dh, "p256dh")?;
    let auth_secret = decode_key(&keys.auth, "auth")?;
    if receiver_public.len() != PUBLIC_KEY_LEN {
        return Err(ReminderError::Push("p256dh must be an uncompressed P-256 point".into()));
    }

    let group = sender_key.group();
    let mut ctx = BigNumContext::new()?;
    let sender_public = sender_key
        .public_key()
        .to_bytes(group, PointConversionForm::UNCOMPRESSED, &mut ctx)?;
    let receiver_point = EcPoint::from_bytes(group, &receiver_public, &mut ctx)?;
    let receiver = PKey::from_ec_key(EcKey::from_public_key(group, &receiver_point)?)?;
    let sender = PKey::from_ec_key(sender_key)?;

    let mut deriver = Deriver::new(&sender)?;
    deriver.set_peer(&receiver)?;
    let shared_secret = deriver.derive_to_vec()?;

    let (cek, nonce) = derive_content_keys(&shared_secret, &auth_secret, &receiver_public, &sender_public, &salt)?;

    let mut record = Vec::with_capacity(plaintext.len() + 1);
    record.extend_from_slice(plaintext);
    record.push(LAST_RECORD_DELIMITER);

    let mut tag = [0u8; TAG_LEN];
    let ciphertext = encrypt_aead(Cipher::aes_128_gcm(), &cek, Some(nonce.as_slice()), &[], &record, &mut tag)?;

    let mut body = Vec::with_capacity(SALT_LEN + 4 + 1 + PUBLIC_KEY_LEN + ciphertext.len() + TAG_LEN);
    body.extend_from_slice(&salt);
    body.extend_from_slice(&RECORD_SIZE.to_be_bytes());
    body.push(PUBLIC_KEY_LEN as u8);
    body.extend_from_slice(&sender_public);
    body.extend_from_slice(&ciphertext);
    body.extend_from_slice(&tag);
    Ok(body)
}

/// Content encryption key and nonce from the ECDH secret, per RFC 8291 section 3.4.
fn derive_content_keys(
    shared_secret: &[u8],
    auth_secret: &[u8],
    receiver_public: &[u8],
    sender_public: &[u8],
    salt: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let prk_key = hmac_sha256(auth_secret, &[shared_secret])?;
    let ikm = hmac_sha256(&prk_key, &[b"WebPush: info\0", receiver_public, sender_public, &[0x01]])?;
    let prk = hmac_sha256(salt, &[&ikm])?;

    let cek = hmac_sha256(&prk, &[b"Content-Encoding: aes128gcm\0", &[0x01]])?;
    let nonce = hmac_sha256(&prk, &[b"Content-Encoding: nonce\0", &[0x01]])?;
    Ok((cek[..KEY_LEN].to_vec(), nonce[..NONCE_LEN].to_vec()))
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let key = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &key)?;
    for part in parts {
        signer.update(part)?;
    }
    Ok(signer.sign_to_vec()?)
}

fn decode_key(value: &str, name: &str) -> Result<Vec<u8>> {
    general_purpose::URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| ReminderError::Push(format!("{name} is not base64url: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::symm::decrypt_aead;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Subscriber {
        key: EcKey<Private>,
        keys: PushKeys,
    }

    fn subscriber() -> Subscriber {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = EcKey::generate(&group).unwrap();
        let mut ctx = BigNumContext::new().unwrap();
        let public = key
            .public_key()
            .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)
            .unwrap();
        let mut auth = [0u8; 16];
        rand_bytes(&mut auth).unwrap();
        Subscriber {
            key,
            keys: PushKeys {
                p256dh: general_purpose::URL_SAFE_NO_PAD.encode(public),
                auth: general_purpose::URL_SAFE_NO_PAD.encode(auth),
            },
        }
    }

    /// What the user agent does on receipt.
    fn decrypt(subscriber: &Subscriber, body: &[u8]) -> Vec<u8> {
        let salt = &body[..SALT_LEN];
        let rs = u32::from_be_bytes(body[16..20].try_into().unwrap());
        assert_eq!(rs, RECORD_SIZE);
        let id_len = body[20] as usize;
        let sender_public = &body[21..21 + id_len];
        let sealed = &body[21 + id_len..];
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let group = subscriber.key.group();
        let mut ctx = BigNumContext::new().unwrap();
        let point = EcPoint::from_bytes(group, sender_public, &mut ctx).unwrap();
        let sender = PKey::from_ec_key(EcKey::from_public_key(group, &point).unwrap()).unwrap();
        let receiver = PKey::from_ec_key(subscriber.key.clone()).unwrap();
        let mut deriver = Deriver::new(&receiver).unwrap();
        deriver.set_peer(&sender).unwrap();
        let shared = deriver.derive_to_vec().unwrap();

        let receiver_public = decode_key(&subscriber.keys.p256dh, "p256dh").unwrap();
        let auth = decode_key(&subscriber.keys.auth, "auth").unwrap();
        let (cek, nonce) = derive_content_keys(&shared, &auth, &receiver_public, sender_public, salt).unwrap();

        let mut plain = decrypt_aead(Cipher::aes_128_gcm(), &cek, Some(nonce.as_slice()), &[], ciphertext, tag).unwrap();
        assert_eq!(plain.pop(), Some(LAST_RECORD_DELIMITER));
        plain
    }

    fn payload() -> PushPayload {
        PushPayload {
            title: "Time to take Iron Tablets".into(),
            body: "65mg scheduled for 08:00".into(),
            tag: "medication-iron".into(),
            medication_id: "iron".into(),
            scheduled_time: "08:00".into(),
        }
    }

    #[test]
    fn subscriber_can_decrypt_the_payload() {
        let subscriber = subscriber();
        let plaintext = serde_json::to_vec(&payload()).unwrap();
        let body = encrypt_payload(&subscriber.keys, &plaintext).unwrap();

        assert_eq!(body[20] as usize, PUBLIC_KEY_LEN);
        assert_eq!(decrypt(&subscriber, &body), plaintext);
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let subscriber = subscriber();
        let huge = vec![b'x'; RECORD_SIZE as usize];
        assert!(matches!(encrypt_payload(&subscriber.keys, &huge), Err(ReminderError::Push(_))));
    }

    #[test]
    fn malformed_subscription_keys_are_rejected() {
        let keys = PushKeys {
            p256dh: "AAAA".into(),
            auth: "AAAA".into(),
        };
        assert!(matches!(encrypt_payload(&keys, b"{}"), Err(ReminderError::Push(_))));
    }

    #[tokio::test]
    async fn send_posts_an_encrypted_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/wpush/abc"))
            .and(header("content-encoding", "aes128gcm"))
            .and(header("ttl", "3600"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let subscriber = subscriber();
        let sender = PushSender::new(VapidSigner::generate("mailto:ops@example.net").unwrap()).unwrap();
        let subscription = PushSubscription {
            endpoint: format!("{}/wpush/abc", server.uri()),
            keys: subscriber.keys.clone(),
        };
        sender.send(&subscription, &payload(), 1_700_000_000).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let auth = requests[0].headers.get("authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("vapid t="));
        let decrypted: PushPayload = serde_json::from_slice(&decrypt(&subscriber, &requests[0].body)).unwrap();
        assert_eq!(decrypted, payload());
    }

    #[tokio::test]
    async fn gone_subscriptions_are_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let sender = PushSender::new(VapidSigner::generate("mailto:ops@example.net").unwrap()).unwrap();
        let subscription = PushSubscription {
            endpoint: format!("{}/wpush/expired", server.uri()),
            keys: subscriber().keys,
        };
        assert!(matches!(
            sender.send(&subscription, &payload(), 0).await,
            Err(ReminderError::SubscriptionGone)
        ));
    }
}

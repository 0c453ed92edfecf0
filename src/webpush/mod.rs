//! Web Push message encryption (RFC 8291 / RFC 8188)
//!
//! Generates the per-subscription recipient key material and decrypts
//! inbound push payloads encoded with the `aes128gcm` content coding:
//! ECDH over NIST P-256 with the recipient's static key, two-stage HKDF
//! keyed by the shared authentication secret, AES-128-GCM per record with
//! a sequence-XORed nonce and a 0x01/0x02 padding delimiter.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL;
use base64::Engine;
use hkdf::Hkdf;
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::rand_core::{OsRng, RngCore};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey};
use p256::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::types::error::{PushError, Result};

/// Authentication secret length per RFC 8291.
const AUTH_SECRET_LEN: usize = 16;
/// Salt length in the `aes128gcm` header.
const SALT_LEN: usize = 16;
/// AES-GCM authentication tag length.
const TAG_LEN: usize = 16;
/// Uncompressed SEC1 P-256 point length.
const PUBLIC_KEY_LEN: usize = 65;
/// Smallest record size the content coding allows.
const MIN_RECORD_SIZE: u32 = 18;

const INFO_IKM: &[u8] = b"WebPush: info\x00";
const INFO_CEK: &[u8] = b"Content-Encoding: aes128gcm\x00";
const INFO_NONCE: &[u8] = b"Content-Encoding: nonce\x00";

/// Recipient-side key material owned by exactly one push subscription.
///
/// Either all three fields are present or the material counts as absent;
/// partial material means "no encryption" and is never used to decrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    /// Uncompressed SEC1 P-256 point (65 bytes).
    pub public_key: Vec<u8>,
    /// Raw 32-byte P-256 scalar; PKCS#8 DER is accepted on parse.
    pub private_key: Vec<u8>,
    /// 16 random bytes shared with the application server.
    pub authentication_secret: Vec<u8>,
}

impl KeyMaterial {
    /// All three fields non-empty. Anything less must be treated as
    /// "no encryption" by callers.
    pub fn is_complete(&self) -> bool {
        !self.public_key.is_empty()
            && !self.private_key.is_empty()
            && !self.authentication_secret.is_empty()
    }

    /// Public key as base64url without padding, the `p256dh` value sent to
    /// the remote server.
    pub fn encoded_public_key(&self) -> String {
        BASE64URL.encode(&self.public_key)
    }

    /// Authentication secret as base64url without padding, the `auth` value
    /// sent to the remote server.
    pub fn encoded_authentication_secret(&self) -> String {
        BASE64URL.encode(&self.authentication_secret)
    }
}

/// Generate fresh key material for one registration attempt.
///
/// Key pairs are never reused across accounts or attempts.
pub fn generate_key_material() -> Result<KeyMaterial> {
    let secret = SecretKey::random(&mut OsRng);
    let public_key = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
    let private_key = secret.to_bytes().to_vec();
    let mut authentication_secret = vec![0u8; AUTH_SECRET_LEN];
    OsRng.fill_bytes(&mut authentication_secret);
    Ok(KeyMaterial {
        public_key,
        private_key,
        authentication_secret,
    })
}

/// Decrypt an `aes128gcm` message against the given recipient key material.
///
/// Any header, key, tag or padding violation is a [`PushError::Crypto`];
/// callers drop the message and never retry.
pub fn decrypt(ciphertext: &[u8], key_material: &KeyMaterial) -> Result<Vec<u8>> {
    if !key_material.is_complete() {
        return Err(PushError::Crypto("incomplete key material".into()));
    }
    let header = Header::parse(ciphertext)?;
    let sender_public = PublicKey::from_sec1_bytes(header.key_id)
        .map_err(|_| PushError::Crypto("sender key is not a valid P-256 point".into()))?;
    let recipient_secret = parse_private_key(&key_material.private_key)?;
    let recipient_public = parse_public_key(&key_material.public_key)?;

    let shared = diffie_hellman(
        recipient_secret.to_nonzero_scalar(),
        sender_public.as_affine(),
    );
    let (cek, base_nonce) = derive_record_keys(
        shared.raw_secret_bytes().as_slice(),
        &key_material.authentication_secret,
        recipient_public.to_encoded_point(false).as_bytes(),
        sender_public.to_encoded_point(false).as_bytes(),
        header.salt,
    )?;

    let cipher = Aes128Gcm::new_from_slice(&cek)
        .map_err(|_| PushError::Crypto("invalid content encryption key".into()))?;

    let chunks: Vec<&[u8]> = header.records.chunks(header.record_size as usize).collect();
    let mut plaintext = Vec::new();
    for (seq, chunk) in chunks.iter().enumerate() {
        if chunk.len() <= TAG_LEN {
            return Err(PushError::Crypto("record too short".into()));
        }
        let nonce = record_nonce(&base_nonce, seq as u64);
        let record = cipher
            .decrypt(Nonce::from_slice(&nonce), *chunk)
            .map_err(|_| PushError::Crypto("record failed authentication".into()))?;
        let last = seq == chunks.len() - 1;
        plaintext.extend_from_slice(strip_padding(&record, last)?);
    }
    Ok(plaintext)
}

struct Header<'a> {
    salt: &'a [u8],
    record_size: u32,
    key_id: &'a [u8],
    records: &'a [u8],
}

impl<'a> Header<'a> {
    fn parse(message: &'a [u8]) -> Result<Self> {
        if message.len() < SALT_LEN + 4 + 1 {
            return Err(PushError::Crypto("message shorter than header".into()));
        }
        let salt = &message[..SALT_LEN];
        let record_size = u32::from_be_bytes([
            message[SALT_LEN],
            message[SALT_LEN + 1],
            message[SALT_LEN + 2],
            message[SALT_LEN + 3],
        ]);
        if record_size < MIN_RECORD_SIZE {
            return Err(PushError::Crypto(format!(
                "record size {record_size} below minimum"
            )));
        }
        let id_len = message[SALT_LEN + 4] as usize;
        let body_start = SALT_LEN + 4 + 1 + id_len;
        if message.len() <= body_start {
            return Err(PushError::Crypto("message has no records".into()));
        }
        Ok(Self {
            salt,
            record_size,
            key_id: &message[SALT_LEN + 4 + 1..body_start],
            records: &message[body_start..],
        })
    }
}

/// Two-stage HKDF of RFC 8291: the authentication secret keys the first
/// extraction, the header salt the second.
fn derive_record_keys(
    shared_secret: &[u8],
    authentication_secret: &[u8],
    recipient_public: &[u8],
    sender_public: &[u8],
    salt: &[u8],
) -> Result<([u8; 16], [u8; 12])> {
    let mut info = Vec::with_capacity(INFO_IKM.len() + 2 * PUBLIC_KEY_LEN);
    info.extend_from_slice(INFO_IKM);
    info.extend_from_slice(recipient_public);
    info.extend_from_slice(sender_public);

    let mut ikm = [0u8; 32];
    Hkdf::<Sha256>::new(Some(authentication_secret), shared_secret)
        .expand(&info, &mut ikm)
        .map_err(|_| PushError::Crypto("HKDF expand failed for IKM".into()))?;

    let prk = Hkdf::<Sha256>::new(Some(salt), &ikm);
    let mut cek = [0u8; 16];
    prk.expand(INFO_CEK, &mut cek)
        .map_err(|_| PushError::Crypto("HKDF expand failed for CEK".into()))?;
    let mut nonce = [0u8; 12];
    prk.expand(INFO_NONCE, &mut nonce)
        .map_err(|_| PushError::Crypto("HKDF expand failed for nonce".into()))?;
    Ok((cek, nonce))
}

/// Nonce for record `seq`: the derived base nonce XOR the big-endian
/// sequence number.
fn record_nonce(base: &[u8; 12], seq: u64) -> [u8; 12] {
    let mut nonce = *base;
    for (i, byte) in seq.to_be_bytes().iter().enumerate() {
        nonce[4 + i] ^= byte;
    }
    nonce
}

/// Remove the zero padding and the delimiter octet: 0x02 closes the final
/// record, 0x01 every other one.
fn strip_padding(record: &[u8], last: bool) -> Result<&[u8]> {
    let mut end = record.len();
    while end > 0 && record[end - 1] == 0 {
        end -= 1;
    }
    if end == 0 {
        return Err(PushError::Crypto("record is missing its delimiter".into()));
    }
    let expected = if last { 2 } else { 1 };
    if record[end - 1] != expected {
        return Err(PushError::Crypto(format!(
            "unexpected padding delimiter {:#04x}",
            record[end - 1]
        )));
    }
    Ok(&record[..end - 1])
}

fn parse_private_key(bytes: &[u8]) -> Result<SecretKey> {
    if bytes.len() == 32 {
        SecretKey::from_slice(bytes)
            .map_err(|_| PushError::Crypto("private key is not a valid P-256 scalar".into()))
    } else {
        // The original client persisted JCA-encoded (PKCS#8) private keys.
        SecretKey::from_pkcs8_der(bytes)
            .map_err(|_| PushError::Crypto("private key is neither a raw scalar nor PKCS#8".into()))
    }
}

fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    if bytes.first() == Some(&0x04) && bytes.len() == PUBLIC_KEY_LEN {
        PublicKey::from_sec1_bytes(bytes)
            .map_err(|_| PushError::Crypto("public key is not a valid P-256 point".into()))
    } else {
        PublicKey::from_public_key_der(bytes)
            .map_err(|_| PushError::Crypto("public key is neither SEC1 nor SPKI".into()))
    }
}

/// Sender side of the construction, used to build authentic ciphertexts in
/// tests. Single record, record size 4096.
#[cfg(test)]
pub(crate) fn encrypt(plaintext: &[u8], key_material: &KeyMaterial) -> Result<Vec<u8>> {
    let ephemeral = SecretKey::random(&mut OsRng);
    let recipient_public = parse_public_key(&key_material.public_key)?;
    let sender_public = ephemeral.public_key().to_encoded_point(false);

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let shared = diffie_hellman(ephemeral.to_nonzero_scalar(), recipient_public.as_affine());
    let (cek, base_nonce) = derive_record_keys(
        shared.raw_secret_bytes().as_slice(),
        &key_material.authentication_secret,
        recipient_public.to_encoded_point(false).as_bytes(),
        sender_public.as_bytes(),
        &salt,
    )?;

    let cipher = Aes128Gcm::new_from_slice(&cek)
        .map_err(|_| PushError::Crypto("invalid content encryption key".into()))?;
    let mut record = plaintext.to_vec();
    record.push(0x02);
    let encrypted = cipher
        .encrypt(Nonce::from_slice(&record_nonce(&base_nonce, 0)), record.as_slice())
        .map_err(|_| PushError::Crypto("record encryption failed".into()))?;

    let mut message = Vec::with_capacity(SALT_LEN + 4 + 1 + PUBLIC_KEY_LEN + encrypted.len());
    message.extend_from_slice(&salt);
    message.extend_from_slice(&4096u32.to_be_bytes());
    message.push(PUBLIC_KEY_LEN as u8);
    message.extend_from_slice(sender_public.as_bytes());
    message.extend_from_slice(&encrypted);
    Ok(message)
}

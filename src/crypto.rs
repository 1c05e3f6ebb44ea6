//! Tuya protocol encryption and decryption logic.
//! AES-128-ECB with the Tuya padding rule, plus the v3.1 / v3.3 payload envelopes.

use crate::error::{Result, TuyaError};
use crate::protocol::{CommandType, DeviceType, PROTOCOL_33_HEADER, SIGNATURE_LEN, Version};
use aes::Aes128;
use base64::{Engine as _, engine::general_purpose};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use ecb::{Decryptor, Encryptor};
use log::{debug, warn};
use md5::{Digest, Md5};
use serde_json::Value;

const BLOCK_SIZE: usize = 16;

/// Marker a device puts in its reply when the request used the wrong payload shape.
pub const DATA_UNVALID: &str = "data unvalid";

/// Result of opening a payload received from a device.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPayload {
    /// Decoded JSON document (an empty object for empty payloads)
    Json(Value),
    /// The device rejected the request shape; the caller must switch to
    /// [`DeviceType::TypeD`] and resend.
    DeviceTypeMismatch,
}

/// TuyaCipher provides AES-128-ECB encryption bound to a device's local key.
pub struct TuyaCipher {
    /// 16-byte encryption key
    key: [u8; 16],
}

impl TuyaCipher {
    /// Create a new TuyaCipher with a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; 16] = key.try_into().map_err(|_| TuyaError::InvalidKey)?;
        Ok(Self { key })
    }

    /// Encrypt data, padding to the next block boundary.
    ///
    /// The pad count is `16 - len % 16`, so block-aligned input gains a whole
    /// block of padding.
    /// * `use_base64`: If true, encode the result in Base64.
    pub fn encrypt(&self, data: &[u8], use_base64: bool) -> Vec<u8> {
        let padding_len = BLOCK_SIZE - data.len() % BLOCK_SIZE;
        let mut padded = Vec::with_capacity(data.len() + padding_len);
        padded.extend_from_slice(data);
        padded.resize(data.len() + padding_len, padding_len as u8);

        let ciphertext = self.encrypt_blocks(padded);
        if use_base64 {
            general_purpose::STANDARD.encode(&ciphertext).into_bytes()
        } else {
            ciphertext
        }
    }

    /// Decrypt data and strip padding.
    ///
    /// The final byte is trusted as the pad count; pad contents are not checked.
    /// * `use_base64`: If true, the input data is expected to be Base64 encoded.
    pub fn decrypt(&self, data: &[u8], use_base64: bool) -> Result<Vec<u8>> {
        let mut plaintext = if use_base64 {
            general_purpose::STANDARD
                .decode(data)
                .map_err(|_| TuyaError::DecryptionFailed)?
        } else {
            data.to_vec()
        };

        if !plaintext.len().is_multiple_of(BLOCK_SIZE) {
            return Err(TuyaError::DecryptionFailed);
        }

        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        for chunk in plaintext.chunks_mut(BLOCK_SIZE) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }

        if let Some(&last) = plaintext.last() {
            let pad_len = (last as usize).min(plaintext.len());
            plaintext.truncate(plaintext.len() - pad_len);
        }
        Ok(plaintext)
    }

    fn encrypt_blocks(&self, mut data: Vec<u8>) -> Vec<u8> {
        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());
        for chunk in data.chunks_mut(BLOCK_SIZE) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }
        data
    }

    /// v3.1 signature: characters 8..24 of `md5("data=" + payload + "||lpv=3.1||" + key)`.
    pub fn sign_v31(&self, encrypted_b64: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(b"data=");
        hasher.update(encrypted_b64);
        hasher.update(b"||lpv=");
        hasher.update(Version::V3_1.as_bytes());
        hasher.update(b"||");
        hasher.update(self.key);
        let digest = hex::encode(hasher.finalize());
        digest[8..8 + SIGNATURE_LEN].to_string()
    }

    /// Wrap a plaintext JSON payload for the wire.
    ///
    /// v3.3 encrypts everything and prepends the protocol header except on the
    /// type-A status query. v3.1 only encrypts and signs control commands.
    pub fn encode_payload(&self, version: Version, cmd: u32, plaintext: &[u8]) -> Vec<u8> {
        match version {
            Version::V3_3 => {
                let encrypted = self.encrypt(plaintext, false);
                if cmd == CommandType::DpQuery as u32 {
                    encrypted
                } else {
                    let mut payload = Vec::with_capacity(PROTOCOL_33_HEADER.len() + encrypted.len());
                    payload.extend_from_slice(&PROTOCOL_33_HEADER);
                    payload.extend_from_slice(&encrypted);
                    payload
                }
            }
            Version::V3_1 => {
                if cmd != CommandType::Control as u32 {
                    return plaintext.to_vec();
                }
                let encrypted = self.encrypt(plaintext, true);
                let signature = self.sign_v31(&encrypted);
                let mut payload = Vec::with_capacity(3 + SIGNATURE_LEN + encrypted.len());
                payload.extend_from_slice(Version::V3_1.as_bytes());
                payload.extend_from_slice(signature.as_bytes());
                payload.extend_from_slice(&encrypted);
                payload
            }
        }
    }

    /// Unwrap a payload received from a device into JSON.
    pub fn decode_payload(
        &self,
        version: Version,
        dev_type: DeviceType,
        payload: &[u8],
    ) -> Result<DecodedPayload> {
        if payload.is_empty() {
            return Ok(DecodedPayload::Json(Value::Object(Default::default())));
        }

        let v31_tag = Version::V3_1.as_bytes();
        let text = if payload.starts_with(v31_tag) {
            let body = payload
                .get(v31_tag.len() + SIGNATURE_LEN..)
                .ok_or_else(|| TuyaError::DecodeError("v3.1 payload too short".into()))?;
            self.decrypt(body, true)?
        } else if version == Version::V3_3 {
            let body = if dev_type != DeviceType::TypeA
                || payload.starts_with(Version::V3_3.as_bytes())
            {
                payload.get(PROTOCOL_33_HEADER.len()..).unwrap_or_default()
            } else {
                payload
            };

            let text = match self.decrypt(body, false) {
                Ok(decrypted) => decrypted,
                Err(e) => {
                    if contains_unvalid(payload) || payload.first() == Some(&b'{') {
                        debug!("Payload is not encrypted, using it as-is");
                        payload.to_vec()
                    } else {
                        return Err(e);
                    }
                }
            };

            if contains_unvalid(&text) {
                warn!("'{}' reported by device ({})", DATA_UNVALID, dev_type);
                return Ok(DecodedPayload::DeviceTypeMismatch);
            }
            text
        } else if payload.first() == Some(&b'{') {
            payload.to_vec()
        } else {
            return Err(TuyaError::DecodeError(format!(
                "Unexpected payload: {}",
                hex::encode(payload)
            )));
        };

        debug!("Decrypted payload: {}", String::from_utf8_lossy(&text));
        if text.is_empty() {
            return Ok(DecodedPayload::Json(Value::Object(Default::default())));
        }
        serde_json::from_slice(&text)
            .map(DecodedPayload::Json)
            .map_err(|e| TuyaError::DecodeError(e.to_string()))
    }
}

fn contains_unvalid(data: &[u8]) -> bool {
    String::from_utf8_lossy(data).contains(DATA_UNVALID)
}

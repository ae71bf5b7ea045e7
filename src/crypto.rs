//! Tuya protocol encryption and decryption logic.
//! Supports AES-128-ECB (v3.1, v3.3) and AES-128-GCM (v3.4, v3.5).

use crate::error::{Result, TuyaError};
use aes::Aes128;
use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use ctr::Ctr32BE;
use ecb::{Decryptor, Encryptor};

/// AES-128-CTR, used only for the unauthenticated GCM-recovery fallback.
type Aes128Ctr32BE = Ctr32BE<Aes128>;

/// TuyaCipher provides AES-128 encryption and decryption in ECB and GCM modes.
pub struct TuyaCipher {
    /// 16-byte encryption key
    key: [u8; 16],
    /// Cached GCM cipher
    gcm: Aes128Gcm,
}

impl TuyaCipher {
    /// Create a new TuyaCipher with a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 16 {
            return Err(TuyaError::EncryptionFailed);
        }
        let mut k = [0u8; 16];
        k.copy_from_slice(key);
        let gcm = Aes128Gcm::new(&k.into());
        Ok(Self { key: k, gcm })
    }

    /// Encrypt data.
    /// * `use_base64`: If true, encode the result in Base64.
    /// * `iv`: Initialization vector. If provided, uses GCM mode; otherwise, ECB mode.
    /// * `header`: Additional authenticated data (AAD) for GCM mode.
    /// * `padding`: If true, applies PKCS7 padding for ECB mode.
    pub fn encrypt(
        &self,
        data: &[u8],
        use_base64: bool,
        iv: Option<&[u8]>,
        header: Option<&[u8]>,
        padding: bool,
    ) -> Result<Vec<u8>> {
        let encrypted_bytes = if let Some(iv_bytes) = iv {
            // GCM Mode (v3.4+)
            let nonce = Nonce::from_slice(&iv_bytes[..12]);

            let payload = Payload {
                msg: data,
                aad: header.unwrap_or(&[]),
            };

            let mut ciphertext = self
                .gcm
                .encrypt(nonce, payload)
                .map_err(|_| TuyaError::EncryptionFailed)?;

            // Format: IV + Ciphertext (includes Tag at the end)
            let mut result = Vec::with_capacity(iv_bytes.len() + ciphertext.len());
            result.extend_from_slice(iv_bytes);
            result.append(&mut ciphertext);
            result
        } else {
            // ECB Mode (v3.1, v3.3)
            let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());

            let padded_data = if padding {
                // Manual PKCS7 padding
                let len = data.len();
                let remainder = len % 16;
                let padding_len = 16 - remainder;

                let mut p = data.to_vec();
                for _ in 0..padding_len {
                    p.push(padding_len as u8);
                }
                p
            } else {
                if !data.len().is_multiple_of(16) {
                    return Err(TuyaError::EncryptionFailed);
                }
                data.to_vec()
            };

            let mut ciphertext = padded_data.clone();
            // Block encryption
            for chunk in ciphertext.chunks_mut(16) {
                let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
                encryptor.encrypt_block_mut(block);
            }

            ciphertext
        };

        if use_base64 {
            use base64::{Engine as _, engine::general_purpose};
            let b64_str = general_purpose::STANDARD.encode(&encrypted_bytes);
            Ok(b64_str.into_bytes())
        } else {
            Ok(encrypted_bytes)
        }
    }

    /// Decrypt data.
    /// * `use_base64`: If true, the input data is expected to be Base64 encoded.
    /// * `iv`: Initialization vector. If provided, uses GCM mode; otherwise, ECB mode.
    /// * `header`: Additional authenticated data (AAD) for GCM mode.
    /// * `_tag`: (Unused) GCM tag is expected to be at the end of input data.
    pub fn decrypt(
        &self,
        data: &[u8],
        use_base64: bool,
        iv: Option<&[u8]>,
        header: Option<&[u8]>,
        _tag: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let input_data = if use_base64 {
            use base64::{Engine as _, engine::general_purpose};
            general_purpose::STANDARD
                .decode(data)
                .map_err(|_| TuyaError::DecryptionFailed)?
        } else {
            data.to_vec()
        };

        if let Some(iv_bytes) = iv {
            // GCM Mode decryption
            let nonce = Nonce::from_slice(&iv_bytes[..12]);

            let payload = Payload {
                msg: &input_data,
                aad: header.unwrap_or(&[]),
            };

            let plaintext = self
                .gcm
                .decrypt(nonce, payload)
                .map_err(|_| TuyaError::DecryptionFailed)?;

            Ok(plaintext)
        } else {
            // ECB Mode decryption
            let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
            let mut plaintext = input_data.clone();

            if plaintext.len() % 16 != 0 {
                return Err(TuyaError::DecryptionFailed);
            }

            // Block decryption
            for chunk in plaintext.chunks_mut(16) {
                let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
                decryptor.decrypt_block_mut(block);
            }

            // PKCS7 unpadding is tolerant: some devices return unpadded
            // plaintext for short messages, so invalid padding is not an
            // error, the data is simply returned as-is.
            if plaintext.is_empty() {
                return Ok(plaintext);
            }
            let pad_len = plaintext[plaintext.len() - 1] as usize;
            if pad_len == 0 || pad_len > 16 || pad_len > plaintext.len() {
                return Ok(plaintext);
            }
            let padding_valid = (0..pad_len).all(|i| plaintext[plaintext.len() - 1 - i] == pad_len as u8);
            if padding_valid {
                plaintext.truncate(plaintext.len() - pad_len);
            }
            Ok(plaintext)
        }
    }

    /// Recover plaintext from a GCM ciphertext+tag blob without verifying
    /// the tag, by running the raw AES-CTR keystream GCM would have used.
    /// GCM's keystream for the message itself starts at counter value 2
    /// (counter 0 derives the hash subkey, counter 1 masks the tag), so the
    /// counter block is `nonce || 0x00000002`.
    pub fn decrypt_ctr_noauth(&self, ciphertext_with_tag: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != 12 {
            return Err(TuyaError::DecryptionFailed);
        }
        if ciphertext_with_tag.len() < 16 {
            return Err(TuyaError::DecryptionFailed);
        }
        let ciphertext = &ciphertext_with_tag[..ciphertext_with_tag.len() - 16];

        let mut counter_block = [0u8; 16];
        counter_block[..12].copy_from_slice(nonce);
        counter_block[12..].copy_from_slice(&2u32.to_be_bytes());

        let mut cipher = Aes128Ctr32BE::new(&self.key.into(), &counter_block.into());
        let mut plaintext = ciphertext.to_vec();
        cipher.apply_keystream(&mut plaintext);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = *b"0123456789abcdef";

    #[test]
    fn ecb_roundtrip_with_padding() {
        let cipher = TuyaCipher::new(&KEY).unwrap();
        let plaintext = b"short message";
        let ciphertext = cipher.encrypt(plaintext, false, None, None, true).unwrap();
        assert_eq!(ciphertext.len() % 16, 0);
        let decrypted = cipher.decrypt(&ciphertext, false, None, None, None).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn ecb_unpad_is_tolerant_of_invalid_padding() {
        let cipher = TuyaCipher::new(&KEY).unwrap();
        // A block-aligned plaintext whose last byte is not a valid PKCS7 pad
        // count; the tolerant unpad must hand it back unchanged rather than
        // fail the whole decode.
        let raw_block = [0x41u8; 16];
        let ciphertext = {
            let mut encryptor = ecb::Encryptor::<aes::Aes128>::new(&KEY.into());
            let mut block = raw_block;
            let ga = cipher::generic_array::GenericArray::from_mut_slice(&mut block);
            encryptor.encrypt_block_mut(ga);
            block.to_vec()
        };
        let decrypted = cipher.decrypt(&ciphertext, false, None, None, None).unwrap();
        assert_eq!(decrypted, raw_block.to_vec());
    }

    #[test]
    fn gcm_roundtrip_with_aad() {
        let cipher = TuyaCipher::new(&KEY).unwrap();
        let iv = [1u8; 12];
        let aad = b"header-bytes";
        let ciphertext = cipher
            .encrypt(b"payload", false, Some(&iv), Some(aad), false)
            .unwrap();
        // encrypt() returns iv || ciphertext || tag; decrypt() expects the
        // remainder once the caller has already stripped the iv.
        let ct_with_tag = &ciphertext[12..];
        let decrypted = cipher
            .decrypt(ct_with_tag, false, Some(&iv), Some(aad), None)
            .unwrap();
        assert_eq!(decrypted, b"payload");
    }

    #[test]
    fn ctr_noauth_recovers_gcm_plaintext_without_the_tag() {
        let cipher = TuyaCipher::new(&KEY).unwrap();
        let iv = [2u8; 12];
        let full = cipher.encrypt(b"hello world", false, Some(&iv), None, false).unwrap();
        let ct_with_tag = &full[12..];
        let recovered = cipher.decrypt_ctr_noauth(ct_with_tag, &iv).unwrap();
        assert_eq!(recovered, b"hello world");
    }
}

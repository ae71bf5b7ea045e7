//! Session-key negotiation (v3.4/v3.5 only).
//!
//! The three handshake messages (SESS_KEY_NEG_START/RESP/FINISH) are framed
//! and sent by [`crate::device`], which owns the raw socket; this module
//! holds the pure, independently-testable math: nonce XOR, HMAC signing of
//! each step, and the per-version session-key derivation.

use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 of `msg` under `key`.
pub fn hmac_sha256(key: &[u8], msg: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
    mac.update(msg);
    Ok(mac.finalize().into_bytes().into())
}

/// Verify `expected` is the HMAC-SHA256 of `msg` under `key`.
pub fn verify_hmac_sha256(key: &[u8], msg: &[u8], expected: &[u8]) -> Result<()> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
    mac.update(msg);
    mac.verify_slice(expected)
        .map_err(|_| TuyaError::EncryptionFailed)
}

/// XOR two 16-byte nonces together.
pub fn xor_nonces(local_nonce: &[u8], remote_nonce: &[u8]) -> Vec<u8> {
    local_nonce
        .iter()
        .zip(remote_nonce.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Derive the v3.4 session key: `AES-ECB(device_key).encrypt(local_nonce XOR remote_nonce)[:16]`.
pub fn derive_session_key_v34(
    device_key: &[u8],
    local_nonce: &[u8],
    remote_nonce: &[u8],
) -> Result<Vec<u8>> {
    let x = xor_nonces(local_nonce, remote_nonce);
    let cipher = TuyaCipher::new(device_key)?;
    cipher.encrypt(&x, false, None, None, false)
}

/// Derive the v3.5 session key: the first 16 bytes of
/// `AES-GCM(device_key).encrypt(local_nonce XOR remote_nonce)` using
/// `local_nonce[..12]` as the IV and an empty AAD. `encrypt` returns
/// `iv || ciphertext || tag`, so the session key sits at offset 12.
pub fn derive_session_key_v35(
    device_key: &[u8],
    local_nonce: &[u8],
    remote_nonce: &[u8],
) -> Result<Vec<u8>> {
    let x = xor_nonces(local_nonce, remote_nonce);
    let cipher = TuyaCipher::new(device_key)?;
    let iv = &local_nonce[..12];
    let out = cipher.encrypt(&x, false, Some(iv), None, false)?;
    if out.len() < 28 {
        return Err(TuyaError::HandshakeFailed);
    }
    Ok(out[12..28].to_vec())
}

/// Parse and verify a SESS_KEY_NEG_RESP payload: `remote_nonce[16] || hmac_sha256(device_key, local_nonce)[32]`.
/// Returns the remote nonce. A HMAC mismatch is logged by the caller but not
/// treated as fatal here (some firmware sends a wrong HMAC); only a
/// too-short payload is a hard failure.
pub fn parse_neg_resp(payload: &[u8]) -> Result<&[u8]> {
    if payload.len() < 48 {
        return Err(TuyaError::HandshakeFailed);
    }
    Ok(&payload[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_KEY: [u8; 16] = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
        0x10,
    ];

    #[test]
    fn v34_session_key_is_deterministic() {
        let local_nonce = [0u8; 16];
        let remote_nonce = [0xFFu8; 16];

        let x = xor_nonces(&local_nonce, &remote_nonce);
        assert_eq!(x, remote_nonce.to_vec());

        let expected = TuyaCipher::new(&DEVICE_KEY)
            .unwrap()
            .encrypt(&remote_nonce, false, None, None, false)
            .unwrap();

        let key = derive_session_key_v34(&DEVICE_KEY, &local_nonce, &remote_nonce).unwrap();
        assert_eq!(key, expected[..16]);
        assert_eq!(key.len(), 16);
    }

    #[test]
    fn v35_session_key_is_16_bytes() {
        let local_nonce = [7u8; 16];
        let remote_nonce = [9u8; 16];
        let key = derive_session_key_v35(&DEVICE_KEY, &local_nonce, &remote_nonce).unwrap();
        assert_eq!(key.len(), 16);
    }

    #[test]
    fn neg_resp_too_short_is_rejected() {
        assert!(parse_neg_resp(&[0u8; 10]).is_err());
    }

    #[test]
    fn hmac_round_trips() {
        let mac = hmac_sha256(&DEVICE_KEY, b"hello").unwrap();
        assert!(verify_hmac_sha256(&DEVICE_KEY, b"hello", &mac).is_ok());
        assert!(verify_hmac_sha256(&DEVICE_KEY, b"hellp", &mac).is_err());
    }
}

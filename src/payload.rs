//! Builds the logical JSON envelope for an operation (command + DP data),
//! applying the per-device-type command overrides and field layout; the
//! per-version encryption/version-header rules live alongside it since both
//! are driven by the same (version, device type) pair.

use crate::crypto::TuyaCipher;
use crate::error::Result;
use crate::protocol::CommandType;
use serde_json::Value;
use std::collections::BTreeSet;

/// Commands that never carry the 15-byte version header.
pub const NO_HEADER_CMDS: &[u32] = &[
    CommandType::DpQuery as u32,
    CommandType::DpQueryNew as u32,
    CommandType::UpdateDps as u32,
    CommandType::HeartBeat as u32,
    CommandType::SessKeyNegStart as u32,
    CommandType::SessKeyNegResp as u32,
    CommandType::SessKeyNegFinish as u32,
    CommandType::LanExtStream as u32,
];

/// Which payload template and wire quirks apply to the active connection.
///
/// Named `type_0a`/`type_0d` in the wider Tuya LAN ecosystem: a `type_0d`
/// device answers a plain DP_QUERY with `"data unvalid"` and must be queried
/// with a CONTROL_NEW-shaped request instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    TypeA,
    TypeD,
}

impl DeviceType {
    pub fn is_type_d(self) -> bool {
        matches!(self, DeviceType::TypeD)
    }
}

const KEY_CID: &str = "cid";
const KEY_DPS: &str = "dps";
const KEY_T: &str = "t";
const KEY_DATA: &str = "data";
const KEY_PROTOCOL: &str = "protocol";
const KEY_CTYPE: &str = "ctype";
const KEY_GW_ID: &str = "gwId";
const KEY_DEV_ID: &str = "devId";
const KEY_UID: &str = "uid";
const KEY_REQ_TYPE: &str = "reqType";

/// Inputs needed to build an outbound envelope, independent of any live
/// connection state.
pub struct EnvelopeParams<'a> {
    pub device_id: &'a str,
    pub cid: Option<&'a str>,
    pub version: f32,
    pub dev_type: DeviceType,
    pub timestamp: u64,
    pub req_type: Option<&'a str>,
}

/// Build the outbound command byte and JSON envelope for `command`.
///
/// `pending_dps`, when non-empty, supplies the DP-id set a `type_0d` device
/// should be queried for (used by `detect_available_dps`); it is used only
/// when `data` is `None` and the resolved command is the query override.
pub fn build_envelope(
    command: CommandType,
    data: Option<Value>,
    pending_dps: Option<&BTreeSet<u32>>,
    params: &EnvelopeParams,
) -> (u32, Value) {
    let mut cmd_to_send = command as u32;
    if params.version >= 3.4 {
        cmd_to_send = match command {
            CommandType::Control => CommandType::ControlNew as u32,
            CommandType::DpQuery => CommandType::DpQueryNew as u32,
            _ => cmd_to_send,
        };
    }
    // Checked against the original, pre-remap command: on v3.4+ a DpQuery
    // has already become DpQueryNew above, so matching post-remap would
    // never fire this override for those versions.
    if params.dev_type.is_type_d() && command == CommandType::DpQuery {
        cmd_to_send = CommandType::ControlNew as u32;
    }

    let final_data = match (params.dev_type, cmd_to_send, data.as_ref()) {
        (DeviceType::TypeD, c, None) if c == CommandType::ControlNew as u32 => {
            match pending_dps.filter(|s| !s.is_empty()) {
                Some(ids) => {
                    let mut m = serde_json::Map::new();
                    for id in ids {
                        m.insert(id.to_string(), Value::Null);
                    }
                    Some(Value::Object(m))
                }
                None => Some(serde_json::json!({"1": null})),
            }
        }
        _ => data,
    };

    let mut payload = serde_json::Map::new();
    if let Some(c) = params.cid {
        payload.insert(KEY_CID.into(), c.into());
    }

    let use_nested = params.version >= 3.4
        && matches!(
            CommandType::from_u32(cmd_to_send),
            Some(CommandType::ControlNew | CommandType::LanExtStream)
        );

    if use_nested {
        payload.insert(KEY_PROTOCOL.into(), 5.into());
        payload.insert(KEY_T.into(), params.timestamp.into());

        let mut data_obj = serde_json::Map::new();
        if let Some(c) = params.cid {
            data_obj.insert(KEY_CID.into(), c.into());
            data_obj.insert(KEY_CTYPE.into(), 0.into());
        }

        if let Some(d) = final_data {
            if cmd_to_send == CommandType::LanExtStream as u32 {
                if let Some(obj) = d.as_object() {
                    data_obj.extend(obj.clone());
                }
            } else {
                data_obj.insert(KEY_DPS.into(), d);
            }
        }
        payload.insert(KEY_DATA.into(), Value::Object(data_obj));
    } else {
        payload.insert(KEY_GW_ID.into(), params.device_id.into());
        payload.insert(
            KEY_DEV_ID.into(),
            params.cid.unwrap_or(params.device_id).into(),
        );
        payload.insert(KEY_UID.into(), params.device_id.into());
        payload.insert(KEY_T.into(), params.timestamp.to_string().into());
        if let Some(d) = final_data {
            payload.insert(KEY_DPS.into(), d);
        }
    }

    if let Some(rt) = params.req_type {
        payload.insert(KEY_REQ_TYPE.into(), rt.into());
    }

    (cmd_to_send, Value::Object(payload))
}

/// Prepend the 3-byte ASCII version tag + 12 zero bytes.
pub fn add_version_header(version_bytes: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = version_bytes.to_vec();
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(payload);
    out
}

/// Strip a previously-prepended 15-byte version header.
pub fn strip_version_header(mut payload: Vec<u8>) -> Vec<u8> {
    if payload.len() >= 15 {
        payload.drain(..15);
    }
    payload
}

/// True if `payload` looks like it starts with a version header: either the
/// literal version tag, or (for `type_0d` devices, whose ciphertext is not
/// always block-aligned to 16 bytes once a header is involved) any payload
/// whose length isn't a clean multiple of the AES block size.
pub fn has_version_header(payload: &[u8], version_bytes: &[u8], dev_type: DeviceType) -> bool {
    payload.len() >= 15
        && (&payload[..3] == version_bytes
            || (dev_type.is_type_d() && !payload.len().is_multiple_of(16)))
}

/// Number of hex characters of the v3.1 MD5 tag kept in the wire header
/// (`digest.hex()[8:24]`).
const V31_TAG_LEN: usize = 16;

/// Compute the v3.1 signature tag: the middle 16 hex characters of
/// `md5("data=<base64 body>||lpv=3.1||<local key>")`.
fn v31_md5_tag(b64_body: &[u8], key: &[u8]) -> String {
    use md5::{Digest, Md5};
    let mut input = Vec::with_capacity(5 + b64_body.len() + 11 + key.len());
    input.extend_from_slice(b"data=");
    input.extend_from_slice(b64_body);
    input.extend_from_slice(b"||lpv=3.1||");
    input.extend_from_slice(key);
    let digest = Md5::digest(&input);
    let hex = hex::encode(digest);
    hex[8..8 + V31_TAG_LEN].to_string()
}

/// Apply the outbound encryption rules for `version`/`dev_type` to a
/// plaintext payload, returning the bytes ready to go into the 55AA frame
/// body (v3.5 encryption happens inside the frame codec instead, see
/// `protocol::pack_message`).
///
/// `key` is the raw local key, needed (alongside `cipher`) to compute the
/// v3.1 MD5 signature tag.
pub fn encrypt_for_version(
    cipher: &TuyaCipher,
    version: f32,
    dev_type: DeviceType,
    cmd: u32,
    version_bytes: &[u8],
    key: &[u8],
    mut payload: Vec<u8>,
) -> Result<Vec<u8>> {
    let use_header = !NO_HEADER_CMDS.contains(&cmd);

    if version >= 3.4 {
        if use_header {
            payload = add_version_header(version_bytes, &payload);
        }
        if version < 3.5 {
            payload = cipher.encrypt(&payload, false, None, None, true)?;
        }
    } else if version >= 3.2 {
        payload = cipher.encrypt(&payload, false, None, None, true)?;
        if use_header {
            payload = add_version_header(version_bytes, &payload);
        }
    } else if dev_type.is_type_d() || cmd == CommandType::Control as u32 {
        // v3.1: only CONTROL is encrypted. The plaintext is ECB+PKCS7
        // encrypted, base64-encoded, then an MD5 signature tag is inserted
        // between the version tag and the base64 body.
        let encrypted = cipher.encrypt(&payload, false, None, None, true)?;
        let b64_body = {
            use base64::{Engine as _, engine::general_purpose};
            general_purpose::STANDARD.encode(&encrypted)
        };
        let tag = v31_md5_tag(b64_body.as_bytes(), key);

        let mut out = Vec::with_capacity(version_bytes.len() + tag.len() + b64_body.len());
        out.extend_from_slice(version_bytes);
        out.extend_from_slice(tag.as_bytes());
        out.extend_from_slice(b64_body.as_bytes());
        payload = out;
    }

    Ok(payload)
}

/// Reverse [`encrypt_for_version`]'s v3.1 signature scheme: strip the
/// version tag + MD5 signature, base64-decode, then ECB-decrypt.
///
/// Only CONTROL responses are signed this way; anything else whose payload
/// doesn't start with the version tag is returned unchanged.
pub fn decrypt_v31_payload(cipher: &TuyaCipher, version_bytes: &[u8], payload: Vec<u8>) -> Result<Vec<u8>> {
    let header_len = version_bytes.len() + V31_TAG_LEN;
    if payload.len() < header_len || &payload[..version_bytes.len()] != version_bytes {
        return Ok(payload);
    }
    let b64_body = &payload[header_len..];
    let decoded = {
        use base64::{Engine as _, engine::general_purpose};
        general_purpose::STANDARD
            .decode(b64_body)
            .map_err(|e| crate::error::TuyaError::DecodeError(e.to_string()))?
    };
    cipher.decrypt(&decoded, false, None, None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v33_control_envelope_has_flat_dps() {
        let params = EnvelopeParams {
            device_id: "devid",
            cid: None,
            version: 3.3,
            dev_type: DeviceType::TypeA,
            timestamp: 1000,
            req_type: None,
        };
        let (cmd, payload) =
            build_envelope(CommandType::Control, Some(serde_json::json!({"1": true})), None, &params);
        assert_eq!(cmd, CommandType::Control as u32);
        assert_eq!(payload["dps"]["1"], true);
        assert_eq!(payload["gwId"], "devid");
    }

    #[test]
    fn v34_control_envelope_nests_under_data() {
        let params = EnvelopeParams {
            device_id: "devid",
            cid: None,
            version: 3.4,
            dev_type: DeviceType::TypeA,
            timestamp: 1000,
            req_type: None,
        };
        let (cmd, payload) =
            build_envelope(CommandType::Control, Some(serde_json::json!({"1": true})), None, &params);
        assert_eq!(cmd, CommandType::ControlNew as u32);
        assert_eq!(payload["data"]["dps"]["1"], true);
        assert!(payload.get("gwId").is_none());
    }

    #[test]
    fn type_d_dp_query_becomes_control_new_with_pending_dps() {
        let params = EnvelopeParams {
            device_id: "devid",
            cid: None,
            version: 3.3,
            dev_type: DeviceType::TypeD,
            timestamp: 1000,
            req_type: None,
        };
        let mut pending = BTreeSet::new();
        pending.insert(2);
        pending.insert(3);
        let (cmd, payload) = build_envelope(CommandType::DpQuery, None, Some(&pending), &params);
        assert_eq!(cmd, CommandType::ControlNew as u32);
        assert_eq!(payload["dps"]["2"], Value::Null);
        assert_eq!(payload["dps"]["3"], Value::Null);
    }

    #[test]
    fn type_d_dp_query_on_v34_still_becomes_control_new_with_pending_dps() {
        let params = EnvelopeParams {
            device_id: "devid",
            cid: None,
            version: 3.4,
            dev_type: DeviceType::TypeD,
            timestamp: 1000,
            req_type: None,
        };
        let mut pending = BTreeSet::new();
        pending.insert(7);
        let (cmd, payload) = build_envelope(CommandType::DpQuery, None, Some(&pending), &params);
        assert_eq!(cmd, CommandType::ControlNew as u32);
        assert_eq!(payload["data"]["dps"]["7"], Value::Null);
    }

    #[test]
    fn v31_control_payload_is_signed_and_base64_encoded() {
        let key = b"0123456789abcdef";
        let cipher = TuyaCipher::new(key).unwrap();
        let plaintext = br#"{"gwId":"devid","dps":{"1":true}}"#.to_vec();
        let wire = encrypt_for_version(
            &cipher,
            3.1,
            DeviceType::TypeA,
            CommandType::Control as u32,
            b"3.1",
            key,
            plaintext.clone(),
        )
        .unwrap();

        assert_eq!(&wire[..3], b"3.1");
        // 16-byte hex tag between the version tag and the base64 body.
        let tag = &wire[3..19];
        assert!(tag.iter().all(|b| b.is_ascii_hexdigit()));

        let recovered = decrypt_v31_payload(&cipher, b"3.1", wire).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn v31_non_control_payload_is_left_unencrypted() {
        let key = b"0123456789abcdef";
        let cipher = TuyaCipher::new(key).unwrap();
        let plaintext = br#"{"gwId":"devid"}"#.to_vec();
        let wire = encrypt_for_version(
            &cipher,
            3.1,
            DeviceType::TypeA,
            CommandType::DpQuery as u32,
            b"3.1",
            key,
            plaintext.clone(),
        )
        .unwrap();
        assert_eq!(wire, plaintext);

        // Unsigned payloads pass through decrypt_v31_payload unchanged too.
        let recovered = decrypt_v31_payload(&cipher, b"3.1", wire).unwrap();
        assert_eq!(recovered, plaintext);
    }
}

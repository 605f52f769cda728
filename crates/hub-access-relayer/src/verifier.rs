use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use serde::Serialize;
use sha3::{Digest, Keccak256};
use thiserror::Error;

const ECDSA_SIGNATURE_BYTES: usize = 65;

/// Proof format, detected from the shape of the raw signature string.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureScheme {
    EcdsaHex,
    LegacyToken,
    JsonEnvelope,
}

impl SignatureScheme {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EcdsaHex => "ECDSA_HEX",
            Self::LegacyToken => "LEGACY_TOKEN",
            Self::JsonEnvelope => "JSON_ENVELOPE",
        }
    }

    /// Rules are checked in order: `0x` prefix, then `@` and `.`, then braces.
    #[must_use]
    pub fn detect(raw: &str) -> Option<Self> {
        if raw.starts_with("0x") {
            Some(Self::EcdsaHex)
        } else if raw.contains('@') && raw.contains('.') {
            Some(Self::LegacyToken)
        } else if raw.starts_with('{') && raw.ends_with('}') {
            Some(Self::JsonEnvelope)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureEnvelope<'a> {
    pub scheme: SignatureScheme,
    pub raw: &'a str,
}

impl<'a> SignatureEnvelope<'a> {
    pub fn sniff(raw: &'a str) -> Result<Self, VerifyError> {
        let scheme = SignatureScheme::detect(raw).ok_or(VerifyError::InvalidFormat)?;
        Ok(Self { scheme, raw })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("signature matches no supported proof format")]
    InvalidFormat,

    #[error("invalid signature: {0}")]
    InvalidSignature(&'static str),

    #[error("recovered signer {recovered} does not match wallet")]
    SignerMismatch { recovered: String },
}

/// Checks that `message` was endorsed by `wallet_address`.
///
/// Never panics; every failure is reported through `VerifyError`.
pub fn verify_signature<'a>(
    message: &str,
    raw_signature: &'a str,
    wallet_address: &str,
) -> Result<SignatureEnvelope<'a>, VerifyError> {
    let envelope = SignatureEnvelope::sniff(raw_signature)?;

    match envelope.scheme {
        SignatureScheme::EcdsaHex => {
            let recovered = recover_personal_signer(message, raw_signature)?;
            if !recovered.eq_ignore_ascii_case(wallet_address.trim()) {
                return Err(VerifyError::SignerMismatch { recovered });
            }
        }
        // Legacy compatibility path. Accepted as-is and must not be extended.
        SignatureScheme::LegacyToken => {}
        // Parsed only; the envelope is not checked against a public key.
        SignatureScheme::JsonEnvelope => {
            serde_json::from_str::<serde_json::Value>(raw_signature)
                .map_err(|_| VerifyError::InvalidSignature("json envelope does not parse"))?;
        }
    }

    Ok(envelope)
}

/// Recovers the `0x`-prefixed lowercase address that produced an EIP-191
/// personal-message signature.
pub fn recover_personal_signer(message: &str, signature_hex: &str) -> Result<String, VerifyError> {
    let hex_body = signature_hex
        .strip_prefix("0x")
        .ok_or(VerifyError::InvalidFormat)?;
    let bytes = hex::decode(hex_body)
        .map_err(|_| VerifyError::InvalidSignature("signature is not valid hex"))?;
    if bytes.len() != ECDSA_SIGNATURE_BYTES {
        return Err(VerifyError::InvalidSignature(
            "signature must decode to 65 bytes",
        ));
    }

    let mut signature = Signature::from_slice(&bytes[..64])
        .map_err(|_| VerifyError::InvalidSignature("malformed r/s values"))?;
    let mut recovery_id = normalize_recovery_id(bytes[64])?;

    // High-s twin of a valid signature: recover with low s and the opposite y parity.
    if let Some(low_s) = signature.normalize_s() {
        signature = low_s;
        recovery_id = RecoveryId::new(!recovery_id.is_y_odd(), recovery_id.is_x_reduced());
    }
    let prehash = personal_message_hash(message);

    let key = VerifyingKey::recover_from_prehash(&prehash, &signature, recovery_id)
        .map_err(|_| VerifyError::InvalidSignature("public key recovery failed"))?;

    Ok(address_from_verifying_key(&key))
}

fn normalize_recovery_id(raw: u8) -> Result<RecoveryId, VerifyError> {
    let id = match raw {
        27 | 28 => raw - 27,
        0 | 1 => raw,
        _ => {
            return Err(VerifyError::InvalidSignature(
                "recovery id must be 0/1 or 27/28",
            ));
        }
    };
    RecoveryId::from_byte(id).ok_or(VerifyError::InvalidSignature("recovery id is invalid"))
}

#[must_use]
pub fn personal_message_hash(message: &str) -> [u8; 32] {
    let bytes = message.as_bytes();
    let prefix = format!("\x19Ethereum Signed Message:\n{}", bytes.len());

    let mut hasher = Keccak256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(bytes);

    let mut out = [0_u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

#[must_use]
pub fn address_from_verifying_key(key: &VerifyingKey) -> String {
    let encoded = key.to_encoded_point(false);
    // uncompressed sec1: 0x04 || x || y
    let digest = Keccak256::digest(&encoded.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

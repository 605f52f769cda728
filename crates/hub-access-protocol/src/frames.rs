use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::address::ProtocolError;

pub const ACCESS_REQUEST_NOT_FOUND: &str = "Access request not found";
pub const USER_NOT_CONNECTED: &str = "User not connected";
pub const INVALID_SIGNATURE_OR_PROOF: &str = "Invalid signature or transaction proof";

/// Lifecycle of an access request. `Accessed` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    Pending,
    Verified,
    Accessed,
    Rejected,
}

impl AccessStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Accessed => "accessed",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessStatus {
    type Err = ProtocolError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(Self::Pending),
            "verified" => Ok(Self::Verified),
            "accessed" => Ok(Self::Accessed),
            "rejected" => Ok(Self::Rejected),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }
}

/// Frames sent by wallet clients and hub terminals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HubAccessClientFrame {
    Register {
        wallet_address: String,
    },
    RegisterHub {
        hub_id: String,
    },
    RequestSignature {
        access_request_id: String,
        message: String,
        hub_id: String,
    },
    SubmitSignature {
        request_id: String,
        signature: String,
        message: String,
    },
}

/// Frames emitted by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HubAccessServerFrame {
    Registered {
        status: String,
        wallet_address: String,
        connection_id: String,
    },
    HubRegistered {
        hub_id: String,
        connection_id: String,
    },
    SignatureNeeded {
        request_id: String,
        message: String,
        hub_id: String,
    },
    SignatureRequested {
        request_id: String,
        wallet_address: String,
    },
    SignatureError {
        request_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wallet_address: Option<String>,
    },
    SignatureVerified {
        request_id: String,
        user_wallet: String,
        timestamp: u64,
    },
    SignatureConfirmed {
        request_id: String,
        status: AccessStatus,
    },
    HubAccessStatusChanged {
        access_request_id: String,
        new_status: AccessStatus,
        member_wallet: String,
        hub_id: String,
        timestamp: u64,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
    },
}

impl HubAccessServerFrame {
    #[must_use]
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: Some(code.to_string()),
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::HubRegistered { .. } => "hub_registered",
            Self::SignatureNeeded { .. } => "signature_needed",
            Self::SignatureRequested { .. } => "signature_requested",
            Self::SignatureError { .. } => "signature_error",
            Self::SignatureVerified { .. } => "signature_verified",
            Self::SignatureConfirmed { .. } => "signature_confirmed",
            Self::HubAccessStatusChanged { .. } => "hub_access_status_changed",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn client_frames_use_event_names_and_camel_case_fields() {
        let frame: HubAccessClientFrame = serde_json::from_value(json!({
            "type": "request_signature",
            "accessRequestId": "r1",
            "message": "m",
            "hubId": "H1"
        }))
        .expect("decode request_signature");

        assert_eq!(
            frame,
            HubAccessClientFrame::RequestSignature {
                access_request_id: "r1".to_string(),
                message: "m".to_string(),
                hub_id: "H1".to_string(),
            }
        );

        let frame: HubAccessClientFrame = serde_json::from_value(json!({
            "type": "register",
            "walletAddress": "0xAbC"
        }))
        .expect("decode register");
        assert!(matches!(
            frame,
            HubAccessClientFrame::Register { wallet_address } if wallet_address == "0xAbC"
        ));
    }

    #[test]
    fn server_frames_serialize_with_wire_shape() {
        let frame = HubAccessServerFrame::HubAccessStatusChanged {
            access_request_id: "r1".to_string(),
            new_status: AccessStatus::Accessed,
            member_wallet: "0xabc".to_string(),
            hub_id: "H1".to_string(),
            timestamp: 42,
        };

        let value = serde_json::to_value(&frame).expect("encode");
        assert_eq!(
            value,
            json!({
                "type": "hub_access_status_changed",
                "accessRequestId": "r1",
                "newStatus": "accessed",
                "memberWallet": "0xabc",
                "hubId": "H1",
                "timestamp": 42
            })
        );
        assert_eq!(frame.event_name(), "hub_access_status_changed");
    }

    #[test]
    fn error_frame_omits_missing_code() {
        let frame = HubAccessServerFrame::Error {
            code: None,
            message: ACCESS_REQUEST_NOT_FOUND.to_string(),
        };

        let value = serde_json::to_value(&frame).expect("encode");
        assert_eq!(
            value,
            json!({ "type": "error", "message": "Access request not found" })
        );
    }

    #[test]
    fn rejects_unknown_client_frame_type() {
        let result = serde_json::from_value::<HubAccessClientFrame>(json!({
            "type": "subscribe",
            "topic": "everything"
        }));

        assert!(result.is_err());
    }

    #[test]
    fn access_status_parses_stored_strings() {
        assert_eq!(
            "accessed".parse::<AccessStatus>().expect("parse"),
            AccessStatus::Accessed
        );

        let err = "granted".parse::<AccessStatus>().expect_err("must reject");
        assert!(err.to_string().contains("granted"));
    }
}

use hub_access_protocol::AccessStatus;
use serde::Serialize;

use crate::store::AccessRequestRecord;
use crate::verifier::SignatureEnvelope;

/// Who moved an access request into `accessed`. `Staff` rows are written by
/// the out-of-band manual approval path.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Approver {
    Signature,
    Staff,
}

impl Approver {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Signature => "signature",
            Self::Staff => "staff",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "signature" => Some(Self::Signature),
            "staff" => Some(Self::Staff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOutcome {
    /// Status changed into `accessed`.
    Granted { previous: AccessStatus },
    /// Already `accessed` with a new proof; only `last_accessed_at_ms` moved.
    Refreshed,
    /// The stored proof was submitted again. Nothing changed.
    Duplicate,
}

impl AccessOutcome {
    #[must_use]
    pub const fn status_changed(self) -> bool {
        matches!(self, Self::Granted { .. })
    }

    #[must_use]
    pub const fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Moves `record` into `accessed` after a verified proof.
///
/// Signature approval enters `accessed` from whatever state the record is in.
/// `verified_at_ms` and `signature` are only written the first time; later
/// proofs refresh `last_accessed_at_ms` and never regress the status.
pub fn apply_signature_access(
    record: &mut AccessRequestRecord,
    envelope: &SignatureEnvelope<'_>,
    now_ms: u64,
) -> AccessOutcome {
    let previous = record.status;
    if previous == AccessStatus::Accessed && record.signature.as_deref() == Some(envelope.raw) {
        return AccessOutcome::Duplicate;
    }

    record.status = AccessStatus::Accessed;
    record.verified_at_ms.get_or_insert(now_ms);
    record.last_accessed_at_ms = Some(now_ms);
    record.approved_by = Some(Approver::Signature);

    if record.signature.is_none() {
        record.signature = Some(envelope.raw.to_string());
        record.signature_scheme = Some(envelope.scheme.as_str().to_string());
    }

    if previous == AccessStatus::Accessed {
        AccessOutcome::Refreshed
    } else {
        AccessOutcome::Granted { previous }
    }
}

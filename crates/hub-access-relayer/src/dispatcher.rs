use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use hub_access_protocol::frames::{
    ACCESS_REQUEST_NOT_FOUND, INVALID_SIGNATURE_OR_PROOF, USER_NOT_CONNECTED,
};
use hub_access_protocol::{AccessStatus, HubAccessServerFrame};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::now_ms;
use crate::registry::ConnectionRegistry;
use crate::state_machine::{self, AccessOutcome};
use crate::store::{AccessRequestRecord, AccessRequestStore};
use crate::verifier::{self, SignatureScheme, VerifyError};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("access request '{0}' not found")]
    NotFound(String),

    #[error("wallet {0} has no live connection")]
    WalletOffline(String),

    #[error("signature rejected: {0}")]
    InvalidSignature(VerifyError),

    #[error("signature matches no supported proof format")]
    InvalidFormat,

    #[error("storage failure: {0:#}")]
    PersistenceFailure(anyhow::Error),
}

impl From<VerifyError> for RelayError {
    fn from(error: VerifyError) -> Self {
        match error {
            VerifyError::InvalidFormat => Self::InvalidFormat,
            other => Self::InvalidSignature(other),
        }
    }
}

impl RelayError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::WalletOffline(_) => "wallet_offline",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::InvalidFormat => "invalid_format",
            Self::PersistenceFailure(_) => "persistence_failure",
        }
    }

    /// Text shown to the person at the hub or wallet.
    #[must_use]
    pub const fn client_message(&self) -> &'static str {
        match self {
            Self::NotFound(_) => ACCESS_REQUEST_NOT_FOUND,
            Self::WalletOffline(_) => USER_NOT_CONNECTED,
            Self::InvalidSignature(_) | Self::InvalidFormat => INVALID_SIGNATURE_OR_PROOF,
            Self::PersistenceFailure(_) => "Access request storage unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub request_id: String,
    pub message: String,
    pub hub_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureResponse {
    pub request_id: String,
    pub signature: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReport {
    pub outcome: AccessOutcome,
    pub hub_recipients: usize,
    pub broadcast_fallback: bool,
}

/// Per-request-id mutual exclusion. Entries are dropped once nobody holds or
/// waits on them.
#[derive(Default)]
pub struct RequestLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

pub struct RequestGuard<'a> {
    locks: &'a RequestLocks,
    request_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl RequestLocks {
    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn acquire(&self, request_id: &str) -> RequestGuard<'_> {
        let lock = Arc::clone(self.map().entry(request_id.to_string()).or_default());
        let guard = lock.lock_owned().await;

        RequestGuard {
            locks: self,
            request_id: request_id.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.map().len()
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.locks.map();
        if map
            .get(&self.request_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.request_id);
        }
    }
}

#[derive(Debug, Clone)]
struct PendingChallenge {
    wallet_connection: String,
    hub_connection: String,
    wallet_address: String,
}

/// Routes challenges from hubs to wallets and verified proofs back to hubs.
pub struct RelayDispatcher {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn AccessRequestStore>,
    locks: RequestLocks,
    pending: Mutex<HashMap<String, PendingChallenge>>,
}

impl RelayDispatcher {
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn AccessRequestStore>) -> Self {
        Self {
            registry,
            store,
            locks: RequestLocks::default(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Forwards `challenge` to the wallet owning the access request.
    ///
    /// Failures are reported to `from_connection` as `signature_error`.
    pub async fn request_signature(
        &self,
        from_connection: &str,
        challenge: Challenge,
    ) -> Result<(), RelayError> {
        let result = self.relay_challenge(from_connection, &challenge).await;

        if let Err(error) = &result {
            let wallet_address = match error {
                RelayError::WalletOffline(wallet) => Some(wallet.clone()),
                _ => None,
            };
            debug!(
                connection_id = from_connection,
                request_id = %challenge.request_id,
                code = error.code(),
                "signature request failed: {error}"
            );
            self.registry
                .send_to(
                    from_connection,
                    HubAccessServerFrame::SignatureError {
                        request_id: challenge.request_id.clone(),
                        message: error.client_message().to_string(),
                        wallet_address,
                    },
                )
                .await;
        }

        result
    }

    async fn relay_challenge(
        &self,
        from_connection: &str,
        challenge: &Challenge,
    ) -> Result<(), RelayError> {
        let _guard = self.locks.acquire(&challenge.request_id).await;
        let record = self.load(&challenge.request_id)?;

        if record.hub_id != challenge.hub_id {
            debug!(
                request_id = %record.id,
                stored_hub = %record.hub_id,
                requesting_hub = %challenge.hub_id,
                "challenge hub differs from access request hub"
            );
        }

        let wallet_connection = self
            .registry
            .resolve_wallet(&record.wallet_address)
            .await
            .ok_or_else(|| RelayError::WalletOffline(record.wallet_address.clone()))?;

        let delivered = self
            .registry
            .send_to(
                &wallet_connection,
                HubAccessServerFrame::SignatureNeeded {
                    request_id: challenge.request_id.clone(),
                    message: challenge.message.clone(),
                    hub_id: challenge.hub_id.clone(),
                },
            )
            .await;
        if !delivered {
            return Err(RelayError::WalletOffline(record.wallet_address));
        }

        self.pending.lock().await.insert(
            record.id.clone(),
            PendingChallenge {
                wallet_connection: wallet_connection.clone(),
                hub_connection: from_connection.to_string(),
                wallet_address: record.wallet_address.clone(),
            },
        );

        self.audit(
            &record.id,
            "signature_requested",
            &json!({
                "hub_id": challenge.hub_id,
                "wallet_connection": wallet_connection,
            }),
        );

        self.registry
            .send_to(
                from_connection,
                HubAccessServerFrame::SignatureRequested {
                    request_id: record.id,
                    wallet_address: record.wallet_address,
                },
            )
            .await;

        Ok(())
    }

    /// Verifies a proof, advances the access request and notifies the hub.
    ///
    /// Failures are reported to `from_connection` as `error` and leave the
    /// access request untouched.
    pub async fn submit_signature(
        &self,
        from_connection: &str,
        response: SignatureResponse,
    ) -> Result<SubmitReport, RelayError> {
        let result = self.accept_response(from_connection, &response).await;

        if let Err(error) = &result {
            warn!(
                connection_id = from_connection,
                request_id = %response.request_id,
                code = error.code(),
                scheme = ?SignatureScheme::detect(&response.signature).map(SignatureScheme::as_str),
                "signature submission rejected: {error}"
            );
            self.registry
                .send_to(
                    from_connection,
                    HubAccessServerFrame::error(error.code(), error.client_message()),
                )
                .await;
        }

        result
    }

    async fn accept_response(
        &self,
        from_connection: &str,
        response: &SignatureResponse,
    ) -> Result<SubmitReport, RelayError> {
        let _guard = self.locks.acquire(&response.request_id).await;
        let mut record = self.load(&response.request_id)?;

        let envelope = verifier::verify_signature(
            &response.message,
            &response.signature,
            &record.wallet_address,
        )?;

        let now = now_ms();
        let outcome = state_machine::apply_signature_access(&mut record, &envelope, now);
        if outcome.is_duplicate() {
            debug!(
                connection_id = from_connection,
                request_id = %record.id,
                "stored proof submitted again; confirming without notifying hub"
            );
            self.confirm(from_connection, &record).await;
            return Ok(SubmitReport {
                outcome,
                hub_recipients: 0,
                broadcast_fallback: false,
            });
        }

        self.store
            .save(&record)
            .map_err(RelayError::PersistenceFailure)?;

        self.pending.lock().await.remove(&record.id);

        let (hub_recipients, broadcast_fallback) = self.notify_hub(&record, now).await;
        self.confirm(from_connection, &record).await;

        if outcome.status_changed() {
            self.registry
                .broadcast(&HubAccessServerFrame::HubAccessStatusChanged {
                    access_request_id: record.id.clone(),
                    new_status: AccessStatus::Accessed,
                    member_wallet: record.wallet_address.clone(),
                    hub_id: record.hub_id.clone(),
                    timestamp: now,
                })
                .await;
        }

        info!(
            request_id = %record.id,
            hub_id = %record.hub_id,
            scheme = envelope.scheme.as_str(),
            granted = outcome.status_changed(),
            hub_recipients,
            "access request verified"
        );
        self.audit(
            &record.id,
            if outcome.status_changed() {
                "access_granted"
            } else {
                "access_refreshed"
            },
            &json!({
                "scheme": envelope.scheme,
                "hub_recipients": hub_recipients,
                "broadcast_fallback": broadcast_fallback,
            }),
        );

        Ok(SubmitReport {
            outcome,
            hub_recipients,
            broadcast_fallback,
        })
    }

    async fn confirm(&self, connection_id: &str, record: &AccessRequestRecord) {
        self.registry
            .send_to(
                connection_id,
                HubAccessServerFrame::SignatureConfirmed {
                    request_id: record.id.clone(),
                    status: record.status,
                },
            )
            .await;
    }

    async fn notify_hub(&self, record: &AccessRequestRecord, now: u64) -> (usize, bool) {
        let frame = HubAccessServerFrame::SignatureVerified {
            request_id: record.id.clone(),
            user_wallet: record.wallet_address.clone(),
            timestamp: now,
        };

        let hub_connections = self.registry.resolve_hub(&record.hub_id).await;
        if !hub_connections.is_empty() {
            let delivered = self.registry.send_to_many(&hub_connections, &frame).await;
            return (delivered, false);
        }

        let delivered = self.registry.broadcast(&frame).await;
        warn!(
            request_id = %record.id,
            hub_id = %record.hub_id,
            recipients = delivered,
            "no hub terminal online; broadcasting signature_verified to all connections"
        );
        (delivered, true)
    }

    /// Cleans up after a closed socket and fails challenges it was holding.
    pub async fn on_disconnect(&self, connection_id: &str) {
        let Some(detached) = self.registry.on_disconnect(connection_id).await else {
            return;
        };

        let orphaned = {
            let mut pending = self.pending.lock().await;
            let ids = pending
                .iter()
                .filter(|(_, challenge)| challenge.wallet_connection == connection_id)
                .map(|(request_id, _)| request_id.clone())
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|challenge| (id, challenge)))
                .collect::<Vec<_>>()
        };

        for (request_id, challenge) in orphaned {
            info!(
                %request_id,
                wallet = %challenge.wallet_address,
                "wallet disconnected with a challenge in flight"
            );
            self.registry
                .send_to(
                    &challenge.hub_connection,
                    HubAccessServerFrame::SignatureError {
                        request_id,
                        message: USER_NOT_CONNECTED.to_string(),
                        wallet_address: Some(challenge.wallet_address),
                    },
                )
                .await;
        }

        debug!(
            connection_id,
            wallet = ?detached.wallet.as_ref().map(ToString::to_string),
            wallet_was_current = detached.wallet_was_current,
            hub_id = ?detached.hub_id,
            "connection detached"
        );
    }

    fn load(&self, request_id: &str) -> Result<AccessRequestRecord, RelayError> {
        self.store
            .find_by_id(request_id)
            .map_err(RelayError::PersistenceFailure)?
            .ok_or_else(|| RelayError::NotFound(request_id.to_string()))
    }

    fn audit(&self, request_id: &str, event_type: &str, detail: &serde_json::Value) {
        if let Err(error) = self
            .store
            .record_event(request_id, event_type, detail, now_ms())
        {
            warn!(request_id, event_type, "failed to record relay event: {error:#}");
        }
    }
}

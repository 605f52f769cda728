use std::collections::{HashMap, HashSet};

use hub_access_protocol::{HubAccessServerFrame, WalletAddress};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};

pub type FrameSender = mpsc::UnboundedSender<HubAccessServerFrame>;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    Wallet,
    Hub,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RegistryEntry {
    pub connection_id: String,
    pub role: Option<ConnectionRole>,
    pub identity: Option<String>,
    pub last_seen_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub connections: usize,
    pub wallets: usize,
    pub hubs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedConnection {
    pub wallet: Option<WalletAddress>,
    /// True when this connection was still the wallet's current one.
    pub wallet_was_current: bool,
    pub hub_id: Option<String>,
}

struct ConnectionEntry {
    sender: FrameSender,
    wallet: Option<WalletAddress>,
    hub_id: Option<String>,
    last_seen_ms: u64,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<String, ConnectionEntry>,
    wallets: HashMap<String, String>,
    hubs: HashMap<String, HashSet<String>>,
}

/// In-memory map from wallet and hub identities to live connections.
///
/// Wallets are last-register-wins; a hub may hold any number of connections.
/// Nothing here is persisted; clients rebuild it by registering again.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, connection_id: &str, sender: FrameSender, now_ms: u64) {
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            connection_id.to_string(),
            ConnectionEntry {
                sender,
                wallet: None,
                hub_id: None,
                last_seen_ms: now_ms,
            },
        );
    }

    pub async fn touch(&self, connection_id: &str, now_ms: u64) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.connections.get_mut(connection_id) {
            entry.last_seen_ms = now_ms;
        }
    }

    /// Returns the connection this registration superseded, if any.
    pub async fn register_wallet(
        &self,
        connection_id: &str,
        wallet: &WalletAddress,
    ) -> Option<String> {
        let mut inner = self.inner.write().await;

        let previous_wallet = inner
            .connections
            .get_mut(connection_id)
            .and_then(|entry| entry.wallet.replace(wallet.clone()));
        if let Some(previous_wallet) = previous_wallet
            && previous_wallet != *wallet
            && inner.wallets.get(previous_wallet.key()).map(String::as_str) == Some(connection_id)
        {
            inner.wallets.remove(previous_wallet.key());
        }

        inner
            .wallets
            .insert(wallet.key().to_string(), connection_id.to_string())
            .filter(|previous| previous != connection_id)
    }

    pub async fn register_hub(&self, connection_id: &str, hub_id: &str) {
        let mut inner = self.inner.write().await;

        let previous_hub = inner
            .connections
            .get_mut(connection_id)
            .and_then(|entry| entry.hub_id.replace(hub_id.to_string()));
        if let Some(previous_hub) = previous_hub
            && previous_hub != hub_id
        {
            remove_hub_member(&mut inner.hubs, &previous_hub, connection_id);
        }

        inner
            .hubs
            .entry(hub_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    pub async fn resolve_wallet(&self, wallet_address: &str) -> Option<String> {
        let key = wallet_address.trim().to_ascii_lowercase();
        self.inner.read().await.wallets.get(&key).cloned()
    }

    pub async fn resolve_hub(&self, hub_id: &str) -> HashSet<String> {
        self.inner
            .read()
            .await
            .hubs
            .get(hub_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drops `connection_id` from every map it appears in.
    ///
    /// A wallet mapping is only removed while it still points at this
    /// connection, so a late disconnect cannot unseat a newer registration.
    pub async fn on_disconnect(&self, connection_id: &str) -> Option<DetachedConnection> {
        let mut inner = self.inner.write().await;
        let entry = inner.connections.remove(connection_id)?;

        let mut wallet_was_current = false;
        if let Some(wallet) = &entry.wallet
            && inner.wallets.get(wallet.key()).map(String::as_str) == Some(connection_id)
        {
            inner.wallets.remove(wallet.key());
            wallet_was_current = true;
        }

        if let Some(hub_id) = &entry.hub_id {
            remove_hub_member(&mut inner.hubs, hub_id, connection_id);
        }

        Some(DetachedConnection {
            wallet: entry.wallet,
            wallet_was_current,
            hub_id: entry.hub_id,
        })
    }

    pub async fn send_to(&self, connection_id: &str, frame: HubAccessServerFrame) -> bool {
        let sender = {
            let inner = self.inner.read().await;
            inner
                .connections
                .get(connection_id)
                .map(|entry| entry.sender.clone())
        };

        sender.is_some_and(|sender| sender.send(frame).is_ok())
    }

    pub async fn send_to_many(
        &self,
        connection_ids: &HashSet<String>,
        frame: &HubAccessServerFrame,
    ) -> usize {
        let senders = {
            let inner = self.inner.read().await;
            connection_ids
                .iter()
                .filter_map(|id| inner.connections.get(id).map(|entry| entry.sender.clone()))
                .collect::<Vec<_>>()
        };

        senders
            .into_iter()
            .filter(|sender| sender.send(frame.clone()).is_ok())
            .count()
    }

    pub async fn broadcast(&self, frame: &HubAccessServerFrame) -> usize {
        let senders = {
            let inner = self.inner.read().await;
            inner
                .connections
                .values()
                .map(|entry| entry.sender.clone())
                .collect::<Vec<_>>()
        };

        senders
            .into_iter()
            .filter(|sender| sender.send(frame.clone()).is_ok())
            .count()
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        RegistryStats {
            connections: inner.connections.len(),
            wallets: inner.wallets.len(),
            hubs: inner.hubs.len(),
        }
    }

    pub async fn entries(&self) -> Vec<RegistryEntry> {
        let inner = self.inner.read().await;
        let mut entries = inner
            .connections
            .iter()
            .map(|(connection_id, entry)| {
                let (role, identity) = match (&entry.wallet, &entry.hub_id) {
                    (Some(wallet), _) => (Some(ConnectionRole::Wallet), Some(wallet.to_string())),
                    (None, Some(hub_id)) => (Some(ConnectionRole::Hub), Some(hub_id.clone())),
                    (None, None) => (None, None),
                };
                RegistryEntry {
                    connection_id: connection_id.clone(),
                    role,
                    identity,
                    last_seen_ms: entry.last_seen_ms,
                }
            })
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        entries
    }
}

fn remove_hub_member(hubs: &mut HashMap<String, HashSet<String>>, hub_id: &str, connection_id: &str) {
    if let Some(members) = hubs.get_mut(hub_id) {
        members.remove(connection_id);
        if members.is_empty() {
            hubs.remove(hub_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet(raw: &str) -> WalletAddress {
        WalletAddress::parse(raw).expect("wallet")
    }

    async fn attached(
        registry: &ConnectionRegistry,
        connection_id: &str,
    ) -> mpsc::UnboundedReceiver<HubAccessServerFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.attach(connection_id, tx, 1).await;
        rx
    }

    fn ping() -> HubAccessServerFrame {
        HubAccessServerFrame::error("ping", "ping")
    }

    #[tokio::test]
    async fn wallet_is_unresolvable_before_registration() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.resolve_wallet("0xabc").await, None);
    }

    #[tokio::test]
    async fn last_wallet_registration_wins() {
        let registry = ConnectionRegistry::new();
        let _rx1 = attached(&registry, "c1").await;
        let _rx2 = attached(&registry, "c2").await;

        assert_eq!(registry.register_wallet("c1", &wallet("0xAbC")).await, None);
        assert_eq!(
            registry.register_wallet("c2", &wallet("0xabc")).await,
            Some("c1".to_string())
        );
        assert_eq!(registry.register_wallet("c2", &wallet("0xABC")).await, None);

        assert_eq!(registry.resolve_wallet("0XABC").await, Some("c2".to_string()));
    }

    #[tokio::test]
    async fn stale_disconnect_does_not_unseat_newer_wallet_connection() {
        let registry = ConnectionRegistry::new();
        let _rx1 = attached(&registry, "c1").await;
        let _rx2 = attached(&registry, "c2").await;
        registry.register_wallet("c1", &wallet("0xabc")).await;
        registry.register_wallet("c2", &wallet("0xabc")).await;

        let detached = registry.on_disconnect("c1").await.expect("known connection");
        assert!(!detached.wallet_was_current);
        assert_eq!(registry.resolve_wallet("0xabc").await, Some("c2".to_string()));

        let detached = registry.on_disconnect("c2").await.expect("known connection");
        assert!(detached.wallet_was_current);
        assert_eq!(registry.resolve_wallet("0xabc").await, None);
        assert!(registry.on_disconnect("c2").await.is_none());
    }

    #[tokio::test]
    async fn switching_wallet_on_same_connection_releases_old_address() {
        let registry = ConnectionRegistry::new();
        let _rx = attached(&registry, "c1").await;
        registry.register_wallet("c1", &wallet("0xaaa")).await;
        registry.register_wallet("c1", &wallet("0xbbb")).await;

        assert_eq!(registry.resolve_wallet("0xaaa").await, None);
        assert_eq!(registry.resolve_wallet("0xbbb").await, Some("c1".to_string()));
    }

    #[tokio::test]
    async fn hub_keeps_every_terminal_connection() {
        let registry = ConnectionRegistry::new();
        let mut rx1 = attached(&registry, "h1").await;
        let mut rx2 = attached(&registry, "h2").await;
        registry.register_hub("h1", "H1").await;
        registry.register_hub("h2", "H1").await;

        let members = registry.resolve_hub("H1").await;
        assert_eq!(members.len(), 2);
        assert_eq!(registry.send_to_many(&members, &ping()).await, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());

        registry.on_disconnect("h1").await;
        assert_eq!(
            registry.resolve_hub("H1").await,
            HashSet::from(["h2".to_string()])
        );
        registry.on_disconnect("h2").await;
        assert!(registry.resolve_hub("H1").await.is_empty());
        assert_eq!(registry.stats().await.hubs, 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_unregistered_connections() {
        let registry = ConnectionRegistry::new();
        let mut rx1 = attached(&registry, "c1").await;
        let mut rx2 = attached(&registry, "c2").await;
        registry.register_wallet("c1", &wallet("0xabc")).await;

        assert_eq!(registry.broadcast(&ping()).await, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn send_to_unknown_or_closed_connection_reports_failure() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to("nobody", ping()).await);

        let rx = attached(&registry, "c1").await;
        drop(rx);
        assert!(!registry.send_to("c1", ping()).await);
    }

    #[tokio::test]
    async fn entries_report_role_identity_and_last_seen() {
        let registry = ConnectionRegistry::new();
        let _rx1 = attached(&registry, "a").await;
        let _rx2 = attached(&registry, "b").await;
        registry.register_wallet("a", &wallet("0xAbC")).await;
        registry.register_hub("b", "H1").await;
        registry.touch("b", 99).await;

        let entries = registry.entries().await;
        assert_eq!(entries[0].role, Some(ConnectionRole::Wallet));
        assert_eq!(entries[0].identity.as_deref(), Some("0xAbC"));
        assert_eq!(entries[1].role, Some(ConnectionRole::Hub));
        assert_eq!(entries[1].last_seen_ms, 99);

        assert_eq!(
            registry.stats().await,
            RegistryStats {
                connections: 2,
                wallets: 1,
                hubs: 1
            }
        );
    }
}

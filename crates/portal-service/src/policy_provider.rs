//! Sources of live guard policy.
//!
//! A provider hands the session a channel of [`PolicyUpdate`]s. The session
//! never reaches for a global store handle; whoever builds it decides where
//! policy comes from.

use anyhow::Result;
use async_trait::async_trait;
use portal_core::policy::{GuardPolicy, POLICY_COLLECTION, POLICY_DOCUMENT};
use portal_core::store::{Document, DocumentStore};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const UPDATE_BUFFER: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyUpdate {
    Policy(GuardPolicy),
    /// Subscription or decoding failed. The last known policy stays in force.
    Unavailable(String),
}

#[async_trait]
pub trait PolicyProvider: Send + Sync {
    /// Start delivering updates. The feed ends when the receiver is dropped.
    async fn subscribe(&self) -> Result<mpsc::Receiver<PolicyUpdate>>;
}

/// Follows the `settings/security` document of a [`DocumentStore`].
pub struct StorePolicyProvider {
    store: Arc<dyn DocumentStore>,
}

impl StorePolicyProvider {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

pub fn decode_policy(doc: &Document) -> Result<GuardPolicy, serde_json::Error> {
    serde_json::from_value(Value::Object(doc.fields.clone()))
}

fn to_update(doc: Option<&Document>) -> Option<PolicyUpdate> {
    let doc = doc?;
    Some(match decode_policy(doc) {
        Ok(policy) => PolicyUpdate::Policy(policy),
        Err(err) => PolicyUpdate::Unavailable(format!("malformed policy document: {err}")),
    })
}

#[async_trait]
impl PolicyProvider for StorePolicyProvider {
    async fn subscribe(&self) -> Result<mpsc::Receiver<PolicyUpdate>> {
        let mut feed = self
            .store
            .subscribe(POLICY_COLLECTION, POLICY_DOCUMENT)
            .await?;
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);

        tokio::spawn(async move {
            let initial = to_update(feed.borrow_and_update().as_ref());
            match initial {
                Some(update) => {
                    if tx.send(update).await.is_err() {
                        return;
                    }
                }
                None => debug!("no policy document yet; keeping cached policy"),
            }

            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    changed = feed.changed() => {
                        if changed.is_err() {
                            warn!("policy subscription closed by store");
                            let _ = tx
                                .send(PolicyUpdate::Unavailable("subscription closed".into()))
                                .await;
                            return;
                        }
                        let update = to_update(feed.borrow_and_update().as_ref());
                        if let Some(update) = update {
                            if tx.send(update).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_core::store::MemoryStore;
    use serde_json::json;

    fn fields(value: Value) -> portal_core::store::Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn delivers_current_then_later_documents() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("settings", "security", fields(json!({"maxRefreshes": 3})))
            .await
            .unwrap();
        let provider = StorePolicyProvider::new(store.clone());
        let mut rx = provider.subscribe().await.unwrap();

        match rx.recv().await.unwrap() {
            PolicyUpdate::Policy(policy) => {
                assert_eq!(policy.max_refreshes, 3);
                assert!(policy.active);
            }
            other => panic!("unexpected {other:?}"),
        }

        store
            .set("settings", "security", fields(json!({"active": false})))
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            PolicyUpdate::Policy(policy) => assert!(!policy.active),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_document_is_reported_unavailable() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("settings", "security", fields(json!({"maxRefreshes": "lots"})))
            .await
            .unwrap();
        let provider = StorePolicyProvider::new(store);
        let mut rx = provider.subscribe().await.unwrap();
        assert!(matches!(rx.recv().await, Some(PolicyUpdate::Unavailable(_))));
    }
}

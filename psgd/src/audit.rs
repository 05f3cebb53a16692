//! Audit logger.
//!
//! Every final decision record is persisted to the rule store synchronously
//! within the request (one retry, then a recorded drop — the user-visible
//! response never blocks on audit failures), and shipped to the external log
//! index best-effort through a bounded broadcast queue. The queue drops the
//! oldest documents on overflow and counts the drops; the shipping worker
//! runs off the request path.
//!
//! Sensitive-content rule: the record carries a truncated digest, counts, and
//! rule identifiers. Raw prompts and matched substrings never reach this
//! module.

use crate::metrics;
use async_trait::async_trait;
use psg_common::GatewayError;
use psg_common::types::DecisionRecord;
use psg_store::RuleStore;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// External log index contract: append with at-least-once semantics.
#[async_trait]
pub trait LogIndex: Send + Sync {
    async fn append(&self, document: JsonValue) -> Result<(), GatewayError>;
}

/// Bounded drop-oldest shipping queue feeding the log index.
pub struct Shipper {
    tx: broadcast::Sender<String>,
    dropped: Arc<AtomicU64>,
}

impl Shipper {
    /// Start the shipping worker. The receiver side lives inside the worker
    /// task; a lagging receiver translates to dropped-oldest documents, which
    /// is exactly the overflow policy we want.
    pub fn start(index: Arc<dyn LogIndex>, buffer: usize) -> Self {
        let (tx, mut rx) = broadcast::channel::<String>(buffer.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let drop_counter = dropped.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(raw) => {
                        let Ok(document) = serde_json::from_str::<JsonValue>(&raw) else {
                            continue;
                        };
                        // At-least-once: one immediate retry on failure.
                        if let Err(first) = index.append(document.clone()).await {
                            if let Err(second) = index.append(document).await {
                                warn!(error = %second, first = %first, "log index append failed twice");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        drop_counter.fetch_add(n, Ordering::Relaxed);
                        metrics::AUDIT_SHIPPER_DROPS_TOTAL.inc_by(n);
                        warn!(dropped = n, "audit shipper queue overflow, oldest dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self { tx, dropped }
    }

    fn enqueue(&self, record: &DecisionRecord) {
        match serde_json::to_string(record) {
            Ok(raw) => {
                let _ = self.tx.send(raw);
            }
            Err(e) => warn!(error = %e, "failed to serialize audit document"),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The audit logger owned by the engine.
pub struct AuditLogger {
    store: RuleStore,
    shipper: Option<Shipper>,
    store_drops: AtomicU64,
}

impl AuditLogger {
    pub fn new(store: RuleStore, shipper: Option<Shipper>) -> Self {
        Self {
            store,
            shipper,
            store_drops: AtomicU64::new(0),
        }
    }

    /// Persist the record. Never fails the request: a failed store write is
    /// retried once (with jitter) and then recorded as a drop.
    pub async fn record(&self, record: &DecisionRecord) {
        let mut stored = self.store.append_decision(record).await;
        if stored.is_err() {
            let jitter = rand::random::<u64>() % 20;
            tokio::time::sleep(std::time::Duration::from_millis(5 + jitter)).await;
            stored = self.store.append_decision(record).await;
        }
        if let Err(e) = stored {
            self.store_drops.fetch_add(1, Ordering::Relaxed);
            metrics::AUDIT_STORE_DROPS_TOTAL.inc();
            warn!(error = %e, tenant = %record.tenant, "decision record dropped after retry");
        } else {
            debug!(
                tenant = %record.tenant,
                decision = %record.decision,
                digest = %record.input_digest,
                "decision recorded"
            );
        }

        if let Some(shipper) = &self.shipper {
            shipper.enqueue(record);
        }
    }

    pub fn store_drops(&self) -> u64 {
        self.store_drops.load(Ordering::Relaxed)
    }
}

//! Rule store operations.

use crate::{StoreError, schema};
use chrono::{DateTime, Utc};
use psg_common::types::{
    Action, BundleStatus, Channel, DecisionRecord, DetectorKind, FilterRule, FindingsSummary,
    ListEntry, ListKind, PolicyBundle,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Input for creating or updating a filter rule.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub bundle_id: i64,
    pub rule_type: DetectorKind,
    pub pattern: String,
    pub threshold: Option<f64>,
    pub action: Action,
    pub context: JsonValue,
    pub enabled: bool,
}

/// Input for creating an allowlist/blocklist entry.
#[derive(Debug, Clone)]
pub struct NewListEntry {
    pub bundle_id: i64,
    pub kind: ListKind,
    pub value: String,
    pub scope: Option<String>,
    pub expire_at: Option<DateTime<Utc>>,
}

/// Filters for `query_decisions`.
#[derive(Debug, Clone, Default)]
pub struct DecisionFilter {
    pub tenant: Option<String>,
    pub decision: Option<Action>,
    pub since: Option<DateTime<Utc>>,
    pub limit: u32,
}

/// Aggregate decision counts for a rolling window.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DecisionStats {
    pub total: u64,
    pub blocked: u64,
    pub by_action: BTreeMap<String, u64>,
}

/// Handle to the rule store. Cheap to clone; all clones share one
/// connection serialized behind a mutex and driven from `spawn_blocking`.
#[derive(Clone)]
pub struct RuleStore {
    conn: Arc<Mutex<Connection>>,
    /// Advisory per-`(tenant, channel)` activation locks: a second activation
    /// for the same pair while one is in flight conflicts immediately.
    activating: Arc<Mutex<HashSet<(String, Channel)>>>,
}

/// Removes the advisory activation key when the activation finishes, on every
/// exit path.
struct ActivationGuard {
    set: Arc<Mutex<HashSet<(String, Channel)>>>,
    key: (String, Channel),
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        self.set.lock().expect("activation lock poisoned").remove(&self.key);
    }
}

impl RuleStore {
    /// Open (creating if absent) the store at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        schema::apply(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            activating: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::apply(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            activating: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().expect("store lock poisoned");
            f(&mut *guard)
        })
        .await
        .map_err(|_| StoreError::Join)?
    }

    // =========================================================================
    // Tenants
    // =========================================================================

    /// Create a tenant if it does not exist. Tenants are never deleted, only
    /// tombstoned.
    pub async fn create_tenant(&self, tenant: &str) -> Result<(), StoreError> {
        let tenant = tenant.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO tenants (id, created_at) VALUES (?1, ?2)",
                params![tenant, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_tenants(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM tenants WHERE tombstoned = 0 ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    // =========================================================================
    // Bundles
    // =========================================================================

    /// Create a draft bundle for a tenant (creating the tenant row if needed).
    pub async fn create_bundle(
        &self,
        tenant: &str,
        name: &str,
        version: &str,
        channel: Channel,
        max_prompt_length: Option<usize>,
        allowed_languages: Option<Vec<String>>,
    ) -> Result<PolicyBundle, StoreError> {
        let tenant = tenant.to_string();
        let name = name.to_string();
        let version = version.to_string();
        self.with_conn(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT OR IGNORE INTO tenants (id, created_at) VALUES (?1, ?2)",
                params![tenant, now.to_rfc3339()],
            )?;
            let languages_json = allowed_languages
                .as_ref()
                .map(|l| serde_json::to_string(l).unwrap_or_else(|_| "[]".into()));
            conn.execute(
                "INSERT INTO policy_bundles
                     (tenant, name, version, channel, status, max_prompt_length,
                      allowed_languages, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'draft', ?5, ?6, ?7)",
                params![
                    tenant,
                    name,
                    version,
                    channel.as_str(),
                    max_prompt_length.map(|n| n as i64),
                    languages_json,
                    now.to_rfc3339(),
                ],
            )?;
            let id = conn.last_insert_rowid();
            debug!(bundle = id, tenant = %tenant, "draft bundle created");
            Ok(PolicyBundle {
                id,
                tenant,
                name,
                version,
                channel,
                status: BundleStatus::Draft,
                max_prompt_length,
                allowed_languages,
                created_at: now,
            })
        })
        .await
    }

    pub async fn get_bundle(&self, bundle_id: i64) -> Result<Option<PolicyBundle>, StoreError> {
        self.with_conn(move |conn| {
            let bundle = conn
                .query_row(
                    "SELECT id, tenant, name, version, channel, status, max_prompt_length,
                            allowed_languages, created_at
                     FROM policy_bundles WHERE id = ?1",
                    params![bundle_id],
                    bundle_from_row,
                )
                .optional()?;
            Ok(bundle)
        })
        .await
    }

    /// The single active bundle for a `(tenant, channel)` pair, if any.
    pub async fn get_active_bundle(
        &self,
        tenant: &str,
        channel: Channel,
    ) -> Result<Option<PolicyBundle>, StoreError> {
        let tenant = tenant.to_string();
        self.with_conn(move |conn| {
            let bundle = conn
                .query_row(
                    "SELECT id, tenant, name, version, channel, status, max_prompt_length,
                            allowed_languages, created_at
                     FROM policy_bundles
                     WHERE tenant = ?1 AND channel = ?2 AND status = 'active'
                     ORDER BY id DESC LIMIT 1",
                    params![tenant, channel.as_str()],
                    bundle_from_row,
                )
                .optional()?;
            Ok(bundle)
        })
        .await
    }

    /// Atomic activation swap, serialized per `(tenant, channel)`.
    ///
    /// All prior active bundles for the pair move to retired and the target
    /// becomes active in one transaction. A concurrent activation for the
    /// same pair loses with `Conflict`; the caller retries. A compare-and-set
    /// against the active bundle observed at entry backs the advisory lock so
    /// interference is refused even across processes.
    pub async fn activate_bundle(
        &self,
        tenant: &str,
        channel: Channel,
        bundle_id: i64,
    ) -> Result<PolicyBundle, StoreError> {
        let key = (tenant.to_string(), channel);
        {
            let mut in_flight = self.activating.lock().expect("activation lock poisoned");
            if !in_flight.insert(key.clone()) {
                return Err(StoreError::Conflict(format!(
                    "activation already in progress for {}/{}",
                    tenant, channel
                )));
            }
        }
        let _guard = ActivationGuard {
            set: self.activating.clone(),
            key,
        };

        let observed = self.get_active_bundle(tenant, channel).await?.map(|b| b.id);

        let tenant = tenant.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

            let target = tx
                .query_row(
                    "SELECT id, tenant, name, version, channel, status, max_prompt_length,
                            allowed_languages, created_at
                     FROM policy_bundles WHERE id = ?1",
                    params![bundle_id],
                    bundle_from_row,
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("bundle {}", bundle_id)))?;
            if target.tenant != tenant {
                return Err(StoreError::NotFound(format!(
                    "bundle {} does not belong to tenant {}",
                    bundle_id, tenant
                )));
            }
            if target.status == BundleStatus::Retired {
                return Err(StoreError::Conflict(format!(
                    "bundle {} is retired and cannot be activated",
                    bundle_id
                )));
            }

            let actual: Option<i64> = tx
                .query_row(
                    "SELECT id FROM policy_bundles
                     WHERE tenant = ?1 AND channel = ?2 AND status = 'active'
                     ORDER BY id DESC LIMIT 1",
                    params![tenant, channel.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if actual != observed {
                return Err(StoreError::Conflict(format!(
                    "active bundle for {}/{} changed during activation",
                    tenant, channel
                )));
            }

            tx.execute(
                "UPDATE policy_bundles SET status = 'retired'
                 WHERE tenant = ?1 AND channel = ?2 AND status = 'active' AND id != ?3",
                params![tenant, channel.as_str(), bundle_id],
            )?;
            tx.execute(
                "UPDATE policy_bundles SET status = 'active', channel = ?2 WHERE id = ?1",
                params![bundle_id, channel.as_str()],
            )?;
            tx.commit()?;

            debug!(bundle = bundle_id, tenant = %tenant, channel = %channel, "bundle activated");
            Ok(PolicyBundle {
                status: BundleStatus::Active,
                channel,
                ..target
            })
        })
        .await
    }

    pub async fn count_active_bundles(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM policy_bundles WHERE status = 'active'",
                [],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    // =========================================================================
    // Rules and lists (draft bundles only)
    // =========================================================================

    fn ensure_draft(conn: &Connection, bundle_id: i64) -> Result<(), StoreError> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM policy_bundles WHERE id = ?1",
                params![bundle_id],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            None => Err(StoreError::NotFound(format!("bundle {}", bundle_id))),
            Some("draft") => Ok(()),
            Some(status) => Err(StoreError::Conflict(format!(
                "bundle {} is {}; only draft bundles are editable",
                bundle_id, status
            ))),
        }
    }

    /// Insert (`rule_id = None`) or update a rule in a draft bundle.
    pub async fn upsert_rule(
        &self,
        rule_id: Option<i64>,
        rule: NewRule,
    ) -> Result<FilterRule, StoreError> {
        if let Some(t) = rule.threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(StoreError::Invalid(format!(
                    "threshold {} outside [0, 1]",
                    t
                )));
            }
        }
        self.with_conn(move |conn| {
            Self::ensure_draft(conn, rule.bundle_id)?;
            let context = serde_json::to_string(&rule.context)
                .map_err(|e| StoreError::Invalid(format!("context blob: {}", e)))?;
            let id = match rule_id {
                Some(id) => {
                    let changed = conn.execute(
                        "UPDATE filter_rules
                         SET type = ?2, pattern = ?3, threshold = ?4, action = ?5,
                             context = ?6, enabled = ?7
                         WHERE id = ?1 AND bundle_id = ?8",
                        params![
                            id,
                            rule.rule_type.as_str(),
                            rule.pattern,
                            rule.threshold,
                            rule.action.as_str(),
                            context,
                            rule.enabled,
                            rule.bundle_id,
                        ],
                    )?;
                    if changed == 0 {
                        return Err(StoreError::NotFound(format!("rule {}", id)));
                    }
                    id
                }
                None => {
                    conn.execute(
                        "INSERT INTO filter_rules
                             (bundle_id, type, pattern, threshold, action, context, enabled)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            rule.bundle_id,
                            rule.rule_type.as_str(),
                            rule.pattern,
                            rule.threshold,
                            rule.action.as_str(),
                            context,
                            rule.enabled,
                        ],
                    )?;
                    conn.last_insert_rowid()
                }
            };
            Ok(FilterRule {
                id,
                bundle_id: rule.bundle_id,
                rule_type: rule.rule_type,
                pattern: rule.pattern,
                threshold: rule.threshold,
                action: rule.action,
                context: rule.context,
                enabled: rule.enabled,
            })
        })
        .await
    }

    pub async fn list_rules(&self, bundle_id: i64) -> Result<Vec<FilterRule>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, bundle_id, type, pattern, threshold, action, context, enabled
                 FROM filter_rules WHERE bundle_id = ?1 ORDER BY type, id",
            )?;
            let rows = stmt.query_map(params![bundle_id], rule_from_row)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
        .await
    }

    pub async fn add_allowlist_entry(&self, entry: NewListEntry) -> Result<ListEntry, StoreError> {
        self.add_list_entry("allowlists", entry).await
    }

    pub async fn add_blocklist_entry(&self, entry: NewListEntry) -> Result<ListEntry, StoreError> {
        self.add_list_entry("blocklists", entry).await
    }

    async fn add_list_entry(
        &self,
        table: &'static str,
        entry: NewListEntry,
    ) -> Result<ListEntry, StoreError> {
        self.with_conn(move |conn| {
            Self::ensure_draft(conn, entry.bundle_id)?;
            conn.execute(
                &format!(
                    "INSERT INTO {} (bundle_id, kind, value, scope, expire_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    table
                ),
                params![
                    entry.bundle_id,
                    entry.kind.as_str(),
                    entry.value,
                    entry.scope,
                    entry.expire_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(ListEntry {
                id: conn.last_insert_rowid(),
                bundle_id: entry.bundle_id,
                kind: entry.kind,
                value: entry.value,
                scope: entry.scope,
                expire_at: entry.expire_at,
            })
        })
        .await
    }

    pub async fn list_allowlist(&self, bundle_id: i64) -> Result<Vec<ListEntry>, StoreError> {
        self.list_entries("allowlists", bundle_id).await
    }

    pub async fn list_blocklist(&self, bundle_id: i64) -> Result<Vec<ListEntry>, StoreError> {
        self.list_entries("blocklists", bundle_id).await
    }

    async fn list_entries(
        &self,
        table: &'static str,
        bundle_id: i64,
    ) -> Result<Vec<ListEntry>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, bundle_id, kind, value, scope, expire_at
                 FROM {} WHERE bundle_id = ?1 ORDER BY kind, value",
                table
            ))?;
            let rows = stmt.query_map(params![bundle_id], list_entry_from_row)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
        .await
    }

    // =========================================================================
    // Decision log
    // =========================================================================

    /// Append a decision record. The record is counts-and-digest only by
    /// construction; raw prompts never reach this method.
    pub async fn append_decision(&self, record: &DecisionRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO decision_logs
                     (tenant, user_id, session_id, ts, route, input_digest, input_length,
                      decision, reasons, bundle_name, bundle_version, channel, latency_ms,
                      findings_summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    record.tenant,
                    record.user_id,
                    record.session_id,
                    record.ts.to_rfc3339(),
                    record.route,
                    record.input_digest,
                    record.input_length as i64,
                    record.decision.as_str(),
                    serde_json::to_string(&record.reasons).unwrap_or_else(|_| "[]".into()),
                    record.bundle_name,
                    record.bundle_version,
                    record.channel.as_str(),
                    record.latency_ms as i64,
                    serde_json::to_string(&record.findings_summary)
                        .unwrap_or_else(|_| "{}".into()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn query_decisions(
        &self,
        filter: DecisionFilter,
    ) -> Result<Vec<DecisionRecord>, StoreError> {
        self.with_conn(move |conn| {
            let limit = if filter.limit == 0 { 100 } else { filter.limit };
            let mut stmt = conn.prepare(
                "SELECT tenant, user_id, session_id, ts, route, input_digest, input_length,
                        decision, reasons, bundle_name, bundle_version, channel, latency_ms,
                        findings_summary
                 FROM decision_logs
                 WHERE (?1 IS NULL OR tenant = ?1)
                   AND (?2 IS NULL OR decision = ?2)
                   AND (?3 IS NULL OR ts >= ?3)
                 ORDER BY ts DESC LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![
                    filter.tenant,
                    filter.decision.map(|a| a.as_str()),
                    filter.since.map(|t| t.to_rfc3339()),
                    limit,
                ],
                decision_from_row,
            )?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
        .await
    }

    /// Aggregate decision counts since `since`.
    pub async fn decision_stats(&self, since: DateTime<Utc>) -> Result<DecisionStats, StoreError> {
        self.with_conn(move |conn| {
            let mut stats = DecisionStats::default();
            let mut stmt = conn.prepare(
                "SELECT decision, COUNT(*) FROM decision_logs
                 WHERE ts >= ?1 GROUP BY decision",
            )?;
            let rows = stmt.query_map(params![since.to_rfc3339()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (action, count) = row?;
                stats.total += count as u64;
                if action == "block" {
                    stats.blocked += count as u64;
                }
                stats.by_action.insert(action, count as u64);
            }
            Ok(stats)
        })
        .await
    }
}

// =========================================================================
// Row mappers
// =========================================================================

fn bundle_from_row(row: &Row<'_>) -> rusqlite::Result<PolicyBundle> {
    let channel: String = row.get(4)?;
    let status: String = row.get(5)?;
    let languages: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    Ok(PolicyBundle {
        id: row.get(0)?,
        tenant: row.get(1)?,
        name: row.get(2)?,
        version: row.get(3)?,
        channel: Channel::parse(&channel).unwrap_or_default(),
        status: BundleStatus::parse(&status).unwrap_or(BundleStatus::Retired),
        max_prompt_length: row.get::<_, Option<i64>>(6)?.map(|n| n as usize),
        allowed_languages: languages.and_then(|l| serde_json::from_str(&l).ok()),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<FilterRule> {
    let rule_type: String = row.get(2)?;
    let action: String = row.get(5)?;
    let context: String = row.get(6)?;
    Ok(FilterRule {
        id: row.get(0)?,
        bundle_id: row.get(1)?,
        rule_type: DetectorKind::parse(&rule_type).unwrap_or(DetectorKind::Static),
        pattern: row.get(3)?,
        threshold: row.get(4)?,
        action: Action::parse(&action).unwrap_or(Action::LogOnly),
        context: serde_json::from_str(&context).unwrap_or(JsonValue::Null),
        enabled: row.get(7)?,
    })
}

fn list_entry_from_row(row: &Row<'_>) -> rusqlite::Result<ListEntry> {
    let kind: String = row.get(2)?;
    let expire_at: Option<String> = row.get(5)?;
    Ok(ListEntry {
        id: row.get(0)?,
        bundle_id: row.get(1)?,
        kind: ListKind::parse(&kind).unwrap_or(ListKind::Exact),
        value: row.get(3)?,
        scope: row.get(4)?,
        expire_at: expire_at
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(|t| t.with_timezone(&Utc)),
    })
}

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<DecisionRecord> {
    let ts: String = row.get(3)?;
    let decision: String = row.get(7)?;
    let reasons: String = row.get(8)?;
    let channel: String = row.get(11)?;
    let summary: String = row.get(13)?;
    Ok(DecisionRecord {
        tenant: row.get(0)?,
        user_id: row.get(1)?,
        session_id: row.get(2)?,
        ts: DateTime::parse_from_rfc3339(&ts)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        route: row.get(4)?,
        input_digest: row.get(5)?,
        input_length: row.get::<_, i64>(6)? as usize,
        decision: Action::parse(&decision).unwrap_or(Action::Block),
        reasons: serde_json::from_str(&reasons).unwrap_or_default(),
        bundle_name: row.get(9)?,
        bundle_version: row.get(10)?,
        channel: Channel::parse(&channel).unwrap_or_default(),
        latency_ms: row.get::<_, i64>(12)? as u64,
        findings_summary: serde_json::from_str::<FindingsSummary>(&summary).unwrap_or_default(),
    })
}

//! Logical schema for the rule store.
//!
//! Tables: `tenants`, `policy_bundles`, `filter_rules`, `allowlists`,
//! `blocklists`, `decision_logs`. Timestamps are RFC 3339 strings; JSON
//! blobs (rule context, reasons, findings summaries) are serialized text.

use rusqlite::Connection;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id          TEXT PRIMARY KEY,
    tombstoned  INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS policy_bundles (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant             TEXT NOT NULL REFERENCES tenants(id),
    name               TEXT NOT NULL,
    version            TEXT NOT NULL,
    channel            TEXT NOT NULL CHECK (channel IN ('dev', 'staging', 'prod')),
    status             TEXT NOT NULL DEFAULT 'draft'
                           CHECK (status IN ('draft', 'active', 'retired')),
    max_prompt_length  INTEGER,
    allowed_languages  TEXT,
    created_at         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bundles_active
    ON policy_bundles(tenant, channel, status);

CREATE TABLE IF NOT EXISTS filter_rules (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    bundle_id  INTEGER NOT NULL REFERENCES policy_bundles(id),
    type       TEXT NOT NULL
                   CHECK (type IN ('static', 'secret', 'pii', 'injection', 'similarity', 'ml')),
    pattern    TEXT NOT NULL,
    threshold  REAL,
    action     TEXT NOT NULL
                   CHECK (action IN ('block', 'redact', 'require_approval', 'log_only')),
    context    TEXT NOT NULL DEFAULT '{}',
    enabled    INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_rules_bundle ON filter_rules(bundle_id, type);

CREATE TABLE IF NOT EXISTS allowlists (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    bundle_id  INTEGER NOT NULL REFERENCES policy_bundles(id),
    kind       TEXT NOT NULL CHECK (kind IN ('pattern', 'domain', 'exact')),
    value      TEXT NOT NULL,
    scope      TEXT,
    expire_at  TEXT
);
CREATE INDEX IF NOT EXISTS idx_allowlists_bundle ON allowlists(bundle_id);

CREATE TABLE IF NOT EXISTS blocklists (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    bundle_id  INTEGER NOT NULL REFERENCES policy_bundles(id),
    kind       TEXT NOT NULL CHECK (kind IN ('pattern', 'domain', 'exact')),
    value      TEXT NOT NULL,
    scope      TEXT,
    expire_at  TEXT
);
CREATE INDEX IF NOT EXISTS idx_blocklists_bundle ON blocklists(bundle_id);

CREATE TABLE IF NOT EXISTS decision_logs (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant            TEXT NOT NULL,
    user_id           TEXT,
    session_id        TEXT NOT NULL,
    ts                TEXT NOT NULL,
    route             TEXT NOT NULL,
    input_digest      TEXT NOT NULL,
    input_length      INTEGER NOT NULL,
    decision          TEXT NOT NULL,
    reasons           TEXT NOT NULL DEFAULT '[]',
    bundle_name       TEXT NOT NULL,
    bundle_version    TEXT NOT NULL,
    channel           TEXT NOT NULL,
    latency_ms        INTEGER NOT NULL,
    findings_summary  TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_decisions_tenant_ts ON decision_logs(tenant, ts);
CREATE INDEX IF NOT EXISTS idx_decisions_ts ON decision_logs(ts);
"#;

/// Apply the schema and connection pragmas.
pub fn apply(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA foreign_keys = ON;\n\
         PRAGMA busy_timeout = 5000;",
    )?;
    conn.execute_batch(SCHEMA)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_cleanly_twice() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        apply(&conn).unwrap();
    }

    #[test]
    fn action_check_constraint_enforced() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        conn.execute(
            "INSERT INTO tenants (id, created_at) VALUES ('t1', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO policy_bundles (tenant, name, version, channel, created_at)
             VALUES ('t1', 'b', '1', 'prod', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let err = conn.execute(
            "INSERT INTO filter_rules (bundle_id, type, pattern, action)
             VALUES (1, 'static', 'x', 'deny')",
            [],
        );
        assert!(err.is_err(), "unknown action must be rejected");
    }
}

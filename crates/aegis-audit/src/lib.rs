use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use aegis_core::{AuditEntry, OutcomeStatus, RiskTier};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};

/// Append-only record of every submitted action. The ledger is written
/// after the outcome is known and never gates execution: a broken audit
/// database degrades to a warning plus a counter, not a refusal.
pub struct AuditLedger {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    degraded: AtomicU64,
}

impl AuditLedger {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db directory {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open audit database at {}", db_path.display()))?;
        let ledger = Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
            degraded: AtomicU64::new(0),
        };
        ledger.migrate()?;
        Ok(ledger)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
              version INTEGER PRIMARY KEY,
              name TEXT NOT NULL,
              applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Self::apply_migration(
            &conn,
            1,
            "audit_entries",
            r#"
            CREATE TABLE IF NOT EXISTS audit_entries (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              correlation_id TEXT NOT NULL,
              session_id TEXT NOT NULL,
              resource_id TEXT NOT NULL,
              action TEXT NOT NULL,
              risk_tier TEXT NOT NULL,
              ticket_used TEXT,
              outcome TEXT NOT NULL,
              detail TEXT NOT NULL,
              created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_correlation
              ON audit_entries(correlation_id);

            CREATE INDEX IF NOT EXISTS idx_audit_resource
              ON audit_entries(resource_id, created_at);
            "#,
        )?;

        Ok(())
    }

    fn apply_migration(conn: &Connection, version: i64, name: &str, sql: &str) -> Result<()> {
        let mut stmt = conn.prepare("SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1")?;
        let mut rows = stmt.query(params![version])?;
        if rows.next()?.is_some() {
            return Ok(());
        }

        let tx = conn.unchecked_transaction()?;
        for raw in sql.split(';') {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            tx.execute(trimmed, [])?;
        }
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![version, name],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Appends one entry. Failures are swallowed: the entry is logged at
    /// warn level and the degraded counter is incremented so operators
    /// can see the ledger is incomplete.
    pub fn record(&self, entry: &AuditEntry) {
        if let Err(err) = self.try_record(entry) {
            self.degraded.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                correlation_id = %entry.correlation_id,
                action = %entry.action,
                outcome = entry.outcome.as_str(),
                error = %err,
                "audit write failed, ledger is degraded"
            );
        }
    }

    fn try_record(&self, entry: &AuditEntry) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO audit_entries
               (correlation_id, session_id, resource_id, action,
                risk_tier, ticket_used, outcome, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.correlation_id,
                entry.session_id,
                entry.resource_id,
                entry.action,
                entry.risk_tier.as_str(),
                entry.ticket_used,
                entry.outcome.as_str(),
                entry.detail,
                entry.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Number of entries that failed to persist since the ledger opened.
    pub fn degraded_events(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn entries_for_correlation(&self, correlation_id: &str) -> Result<Vec<AuditEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT correlation_id, session_id, resource_id, action,
                    risk_tier, ticket_used, outcome, detail, created_at
             FROM audit_entries
             WHERE correlation_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![correlation_id], row_to_entry)?;
        collect_entries(rows)
    }

    pub fn entries_for_resource(&self, resource_id: &str, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT correlation_id, session_id, resource_id, action,
                    risk_tier, ticket_used, outcome, detail, created_at
             FROM audit_entries
             WHERE resource_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![resource_id, limit as i64], row_to_entry)?;
        collect_entries(rows)
    }

    pub fn recent_entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT correlation_id, session_id, resource_id, action,
                    risk_tier, ticket_used, outcome, detail, created_at
             FROM audit_entries
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_entry)?;
        collect_entries(rows)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let risk_tier: String = row.get(4)?;
    let outcome: String = row.get(6)?;
    let created_at: String = row.get(8)?;
    Ok(AuditEntry {
        correlation_id: row.get(0)?,
        session_id: row.get(1)?,
        resource_id: row.get(2)?,
        action: row.get(3)?,
        risk_tier: RiskTier::parse(&risk_tier).unwrap_or(RiskTier::Critical),
        ticket_used: row.get(5)?,
        outcome: OutcomeStatus::parse(&outcome).unwrap_or(OutcomeStatus::Failed),
        detail: row.get(7)?,
        timestamp: DateTime::parse_from_rfc3339(&created_at)
            .map(|parsed| parsed.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn collect_entries(
    rows: impl Iterator<Item = rusqlite::Result<AuditEntry>>,
) -> Result<Vec<AuditEntry>> {
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

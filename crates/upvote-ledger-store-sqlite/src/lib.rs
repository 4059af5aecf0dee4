#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use upvote_ledger_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, LedgerError, ProjectName, ToggleAction,
    ToggleOutcome, UpvoteId, UpvoteRecord, UpvoteTally, UserId,
};

pub const LATEST_SCHEMA_VERSION: i64 = 2;

const SCHEMA_UPVOTES_V1: &str = r"
CREATE TABLE IF NOT EXISTS upvotes (
  id TEXT PRIMARY KEY,
  project_name TEXT NOT NULL CHECK (length(project_name) > 0),
  user_id TEXT NOT NULL CHECK (length(user_id) > 0),
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_upvotes_project_user
  ON upvotes(project_name, user_id);
CREATE INDEX IF NOT EXISTS idx_upvotes_project
  ON upvotes(project_name);
";

const DEDUPLICATE_UPVOTES_V2: &str = r"
DELETE FROM upvotes
WHERE id NOT IN (
  SELECT id FROM (
    SELECT id, ROW_NUMBER() OVER (
      PARTITION BY project_name, user_id
      ORDER BY created_at ASC, id ASC
    ) AS pair_rank
    FROM upvotes
  )
  WHERE pair_rank = 1
);
";

const SCHEMA_UPVOTES_V2: &str = r"
DROP INDEX IF EXISTS idx_upvotes_project_user;
CREATE UNIQUE INDEX IF NOT EXISTS ux_upvotes_project_user
  ON upvotes(project_name, user_id);
";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SchemaStatus {
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.pending_versions.is_empty() && self.current_version == self.target_version
    }
}

pub struct SqliteUpvoteStore {
    conn: Connection,
}

impl SqliteUpvoteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&mut self) -> Result<()> {
        self.migrate_to(LATEST_SCHEMA_VERSION)
    }

    /// Applies pending migrations up to and including `target_version`.
    pub fn migrate_to(&mut self, target_version: i64) -> Result<()> {
        if !(1..=LATEST_SCHEMA_VERSION).contains(&target_version) {
            return Err(anyhow!(
                "unknown schema version {target_version}; latest is {LATEST_SCHEMA_VERSION}"
            ));
        }

        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        for version in self.pending_versions()? {
            if version > target_version {
                break;
            }

            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start migration transaction")?;

            let already_applied: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
                    params![version],
                    |row| row.get(0),
                )
                .context("failed to re-check schema_migrations")?;
            if already_applied {
                continue;
            }

            match version {
                1 => tx
                    .execute_batch(SCHEMA_UPVOTES_V1)
                    .context("failed to apply upvotes schema v1")?,
                2 => {
                    let removed = tx
                        .execute(DEDUPLICATE_UPVOTES_V2, [])
                        .context("failed to deduplicate upvotes before v2")?;
                    if removed > 0 {
                        tracing::warn!(removed, "removed duplicate upvote rows during migration");
                    }
                    tx.execute_batch(SCHEMA_UPVOTES_V2)
                        .context("failed to apply upvotes schema v2")?;
                }
                other => return Err(anyhow!("no migration registered for version {other}")),
            }

            let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![version, now],
            )
            .context("failed to register upvotes schema migration")?;
            tx.commit().context("failed to commit migration transaction")?;

            tracing::info!(version, "applied upvotes schema migration");
        }

        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let pending_versions = self.pending_versions()?;
        let current_version = self.current_version()?;
        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    fn current_version(&self) -> Result<i64> {
        if !self.has_migrations_table()? {
            return Ok(0);
        }
        let version: Option<i64> = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .context("failed to read current schema version")?;
        Ok(version.unwrap_or(0))
    }

    fn pending_versions(&self) -> Result<Vec<i64>> {
        let applied: Vec<i64> = if self.has_migrations_table()? {
            let mut stmt = self
                .conn
                .prepare("SELECT version FROM schema_migrations ORDER BY version ASC")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<i64>>>()
                .context("failed to read schema_migrations")?
        } else {
            Vec::new()
        };

        Ok((1..=LATEST_SCHEMA_VERSION).filter(|version| !applied.contains(version)).collect())
    }

    fn has_migrations_table(&self) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
                [],
                |row| row.get(0),
            )
            .context("failed to inspect sqlite schema")
    }

    /// Adds the upvote when the pair has none, removes it otherwise.
    ///
    /// The lookup and the write share one `BEGIN IMMEDIATE` transaction, so
    /// concurrent toggles on the same database serialize.
    pub fn toggle_upvote(&mut self, project: &ProjectName, user: &UserId) -> Result<ToggleOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start toggle transaction")?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM upvotes WHERE project_name = ?1 AND user_id = ?2 LIMIT 1",
                params![project.as_str(), user.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up existing upvote")?;

        let action = if existing.is_some() {
            tx.execute(
                "DELETE FROM upvotes WHERE project_name = ?1 AND user_id = ?2",
                params![project.as_str(), user.as_str()],
            )
            .context("failed to remove upvote")?;
            ToggleAction::Removed
        } else {
            insert_upvote(&tx, project, user)?;
            ToggleAction::Added
        };

        tx.commit().context("failed to commit toggle transaction")?;
        Ok(ToggleOutcome::from(action))
    }

    pub fn upvote_count(&self, project: &ProjectName) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM upvotes WHERE project_name = ?1",
                params![project.as_str()],
                |row| row.get(0),
            )
            .context("failed to count upvotes")?;
        u64::try_from(count).with_context(|| format!("invalid upvote count: {count}"))
    }

    pub fn has_upvoted(&self, project: &ProjectName, user: &UserId) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM upvotes WHERE project_name = ?1 AND user_id = ?2)",
                params![project.as_str(), user.as_str()],
                |row| row.get(0),
            )
            .context("failed to check upvote membership")
    }

    /// Full scan of every record, aggregated per project and for `user`.
    pub fn tally(&self, user: Option<&UserId>) -> Result<UpvoteTally> {
        let mut stmt = self
            .conn
            .prepare("SELECT project_name, user_id FROM upvotes")
            .context("failed to prepare upvote scan")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to scan upvotes")?;

        Ok(UpvoteTally::from_rows(rows, user))
    }

    pub fn list_upvotes(&self, project: Option<&ProjectName>) -> Result<Vec<UpvoteRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_name, user_id, created_at
                 FROM upvotes
                 WHERE ?1 IS NULL OR project_name = ?1
                 ORDER BY created_at ASC, id ASC",
            )
            .context("failed to prepare upvote listing")?;

        let rows = stmt.query_map(params![project.map(ProjectName::as_str)], parse_upvote_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to list upvotes")
    }

    /// Deletes every upvote. Returns the number of rows removed.
    pub fn reset_all(&mut self) -> Result<u64> {
        let removed = self.conn.execute("DELETE FROM upvotes", []).context("failed to reset upvotes")?;
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn insert_upvote(conn: &Connection, project: &ProjectName, user: &UserId) -> Result<UpvoteId> {
    let id = UpvoteId::generate();
    let created_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
    conn.execute(
        "INSERT INTO upvotes(id, project_name, user_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id.to_string(), project.as_str(), user.as_str(), created_at],
    )
    .context("failed to insert upvote")?;
    Ok(id)
}

fn parse_upvote_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UpvoteRecord> {
    let id_raw: String = row.get(0)?;
    let project_raw: String = row.get(1)?;
    let user_raw: String = row.get(2)?;
    let created_at_raw: String = row.get(3)?;

    Ok(UpvoteRecord {
        id: UpvoteId::parse(&id_raw).map_err(|err| to_sql_error(0, &err))?,
        project_name: ProjectName::parse(project_raw).map_err(|err| to_sql_error(1, &err))?,
        user_id: UserId::parse(user_raw).map_err(|err| to_sql_error(2, &err))?,
        created_at: parse_rfc3339_utc(&created_at_raw).map_err(|err| to_sql_error(3, &err))?,
    })
}

fn to_sql_error(column: usize, err: &LedgerError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())),
    )
}

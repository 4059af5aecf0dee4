use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use upvote_ledger_core::{
    showcase, ProjectCatalog, ProjectName, ShowcaseEntry, ToggleOutcome, UpvoteTally, UserId,
};
use upvote_ledger_store_sqlite::{SchemaStatus, SqliteUpvoteStore};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpvoteStatus {
    pub count: u64,
    pub user_upvoted: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResetResult {
    pub success: bool,
    pub message: &'static str,
    pub removed: u64,
}

/// Path-bound handle to the ledger. Each call opens its own connection so
/// requests never share in-process state.
#[derive(Debug, Clone)]
pub struct LedgerApi {
    db_path: PathBuf,
    catalog: Arc<ProjectCatalog>,
}

impl LedgerApi {
    #[must_use]
    pub fn new(db_path: PathBuf, catalog: ProjectCatalog) -> Self {
        Self { db_path, catalog: Arc::new(catalog) }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn catalog(&self) -> &ProjectCatalog {
        &self.catalog
    }

    fn open_store(&self) -> Result<SqliteUpvoteStore> {
        SqliteUpvoteStore::open(&self.db_path)
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_store()?.schema_status()
    }

    pub fn migrate(&self) -> Result<SchemaStatus> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.schema_status()
    }

    pub fn toggle_upvote(&self, project: &ProjectName, user: &UserId) -> Result<ToggleOutcome> {
        self.open_store()?.toggle_upvote(project, user)
    }

    pub fn upvote_status(&self, project: &ProjectName, user: &UserId) -> Result<UpvoteStatus> {
        let store = self.open_store()?;
        Ok(UpvoteStatus {
            count: store.upvote_count(project)?,
            user_upvoted: store.has_upvoted(project, user)?,
        })
    }

    pub fn tally(&self, user: &UserId) -> Result<UpvoteTally> {
        self.open_store()?.tally(Some(user))
    }

    #[must_use]
    pub fn showcase(&self, tally: &UpvoteTally) -> Vec<ShowcaseEntry> {
        showcase(&self.catalog, tally)
    }

    pub fn reset_all(&self) -> Result<ResetResult> {
        let removed = self.open_store()?.reset_all()?;
        Ok(ResetResult { success: true, message: "All upvotes have been reset", removed })
    }
}

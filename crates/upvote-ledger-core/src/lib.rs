//! Domain types for the project upvote ledger.
//!
//! An [`UpvoteRecord`] is the single fact "this anonymous identity upvoted this
//! project". For any `(project_name, user_id)` pair at most one record exists;
//! toggling flips between presence and absence.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod catalog;

pub use catalog::{project_slug, showcase, CatalogProject, ProjectCatalog, ShowcaseEntry};

pub const PROJECT_NAME_MAX_CHARS: usize = 200;
pub const USER_ID_MAX_CHARS: usize = 128;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("catalog error: {0}")]
    Catalog(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UpvoteId(pub Ulid);

impl UpvoteId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Parses a stored record id.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the value is not a ULID.
    pub fn parse(value: &str) -> Result<Self, LedgerError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| LedgerError::Validation(format!("invalid upvote id {value:?}: {err}")))
    }
}

impl Display for UpvoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a showcased project. Compared exactly (case-sensitive).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectName(String);

impl ProjectName {
    /// Validates a project name as supplied by a caller.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the name is empty or only
    /// whitespace, or longer than [`PROJECT_NAME_MAX_CHARS`]. A whitespace-only
    /// name could never match a catalog entry.
    pub fn parse(value: impl Into<String>) -> Result<Self, LedgerError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(LedgerError::Validation("projectName cannot be empty".to_string()));
        }
        if value.chars().count() > PROJECT_NAME_MAX_CHARS {
            return Err(LedgerError::Validation(format!(
                "projectName MUST be at most {PROJECT_NAME_MAX_CHARS} characters"
            )));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProjectName {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ProjectName> for String {
    fn from(value: ProjectName) -> Self {
        value.0
    }
}

impl Display for ProjectName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque anonymous identity issued to a browser.
///
/// Carries no authentication guarantee: anyone presenting the same value is
/// treated as the same actor.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Validates an identity presented by a client.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the value is empty, too long,
    /// or contains characters outside `[A-Za-z0-9_-]`.
    pub fn parse(value: impl Into<String>) -> Result<Self, LedgerError> {
        let value = value.into();
        if value.is_empty() {
            return Err(LedgerError::Validation("user id cannot be empty".to_string()));
        }
        if value.len() > USER_ID_MAX_CHARS {
            return Err(LedgerError::Validation(format!(
                "user id MUST be at most {USER_ID_MAX_CHARS} characters"
            )));
        }
        if !value.bytes().all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
        {
            return Err(LedgerError::Validation(
                "user id MUST only contain ASCII letters, digits, '-' or '_'".to_string(),
            ));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpvoteRecord {
    pub id: UpvoteId,
    pub project_name: ProjectName,
    pub user_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToggleAction {
    Added,
    Removed,
}

impl ToggleAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Removed => "removed",
        }
    }

    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::Added => "Upvote added successfully",
            Self::Removed => "Upvote removed successfully",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToggleOutcome {
    pub message: String,
    pub action: ToggleAction,
}

impl From<ToggleAction> for ToggleOutcome {
    fn from(action: ToggleAction) -> Self {
        Self { message: action.message().to_string(), action }
    }
}

/// Per-project counts plus the projects upvoted by one identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpvoteTally {
    pub project_counts: BTreeMap<String, u64>,
    pub user_upvoted: BTreeSet<String>,
}

impl UpvoteTally {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Folds `(project_name, user_id)` rows from a full scan into aggregates.
    pub fn from_rows<I>(rows: I, user: Option<&UserId>) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut tally = Self::empty();
        for (project_name, user_id) in rows {
            if user.is_some_and(|user| user.as_str() == user_id) {
                tally.user_upvoted.insert(project_name.clone());
            }
            *tally.project_counts.entry(project_name).or_insert(0) += 1;
        }
        tally
    }

    #[must_use]
    pub fn count_for(&self, project_name: &str) -> u64 {
        self.project_counts.get(project_name).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn has_upvoted(&self, project_name: &str) -> bool {
        self.user_upvoted.contains(project_name)
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.project_counts.values().sum()
    }
}

/// Parses an RFC3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when parsing fails or the offset is not
/// UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Validation("timestamp MUST use UTC offset Z".to_string()));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

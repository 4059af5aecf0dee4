//! Static project catalog and the showcase ordering used by the projects page.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::{LedgerError, UpvoteTally};

const BUILTIN_CATALOG_JSON: &str = include_str!("../catalog/projects.json");

const COMBINING_DIACRITICS: std::ops::RangeInclusive<char> = '\u{300}'..='\u{36f}';

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogProject {
    pub name: String,
    /// Podium place for winning projects, `None` for the rest.
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spanish_description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub product_url: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default, deserialize_with = "one_or_many_urls")]
    pub repository_urls: Vec<String>,
    /// Site-relative path of the project's card image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl CatalogProject {
    #[must_use]
    pub fn slug(&self) -> String {
        project_slug(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectCatalog {
    projects: Vec<CatalogProject>,
}

impl ProjectCatalog {
    /// Decodes and validates a catalog from its JSON array form.
    ///
    /// # Errors
    /// Returns [`LedgerError::Catalog`] when decoding fails, the catalog is
    /// empty, or names, slugs or podium positions collide.
    pub fn from_json(raw: &str) -> Result<Self, LedgerError> {
        let projects: Vec<CatalogProject> = serde_json::from_str(raw)
            .map_err(|err| LedgerError::Catalog(format!("invalid catalog JSON: {err}")))?;
        Self::new(projects)
    }

    /// # Errors
    /// See [`ProjectCatalog::from_json`].
    pub fn new(projects: Vec<CatalogProject>) -> Result<Self, LedgerError> {
        if projects.is_empty() {
            return Err(LedgerError::Catalog("catalog MUST list at least one project".to_string()));
        }

        let mut names = BTreeSet::new();
        let mut slugs = BTreeSet::new();
        let mut positions = BTreeSet::new();
        for project in &projects {
            if project.name.trim().is_empty() {
                return Err(LedgerError::Catalog("project name cannot be empty".to_string()));
            }
            if !names.insert(project.name.as_str()) {
                return Err(LedgerError::Catalog(format!(
                    "duplicate project name {:?}",
                    project.name
                )));
            }
            if !slugs.insert(project.slug()) {
                return Err(LedgerError::Catalog(format!(
                    "project {:?} collides with another project slug {:?}",
                    project.name,
                    project.slug()
                )));
            }
            if let Some(position) = project.position {
                if position == 0 {
                    return Err(LedgerError::Catalog(format!(
                        "project {:?} position MUST be >= 1",
                        project.name
                    )));
                }
                if !positions.insert(position) {
                    return Err(LedgerError::Catalog(format!("duplicate podium position {position}")));
                }
            }
        }

        Ok(Self { projects })
    }

    /// The catalog of the hackathon edition this site was built for.
    ///
    /// # Errors
    /// Returns [`LedgerError::Catalog`] if the embedded catalog is invalid.
    pub fn builtin() -> Result<Self, LedgerError> {
        Self::from_json(BUILTIN_CATALOG_JSON)
    }

    #[must_use]
    pub fn projects(&self) -> &[CatalogProject] {
        &self.projects
    }

    #[must_use]
    pub fn find_by_slug(&self, slug: &str) -> Option<&CatalogProject> {
        self.projects.iter().find(|project| project.slug() == slug)
    }

    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&CatalogProject> {
        self.projects.iter().find(|project| project.name == name)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShowcaseEntry {
    #[serde(flatten)]
    pub project: CatalogProject,
    pub slug: String,
    pub upvotes: u64,
    pub user_upvoted: bool,
}

impl ShowcaseEntry {
    #[must_use]
    pub fn new(project: &CatalogProject, tally: &UpvoteTally) -> Self {
        Self {
            slug: project.slug(),
            upvotes: tally.count_for(&project.name),
            user_upvoted: tally.has_upvoted(&project.name),
            project: project.clone(),
        }
    }
}

/// Joins the catalog with live counts.
///
/// Podium projects come first by position; the rest follow by upvote count,
/// highest first. Ties keep catalog order.
#[must_use]
pub fn showcase(catalog: &ProjectCatalog, tally: &UpvoteTally) -> Vec<ShowcaseEntry> {
    let mut entries: Vec<ShowcaseEntry> =
        catalog.projects().iter().map(|project| ShowcaseEntry::new(project, tally)).collect();

    entries.sort_by(|lhs, rhs| match (lhs.project.position, rhs.project.position) {
        (Some(left), Some(right)) => left.cmp(&right),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => rhs.upvotes.cmp(&lhs.upvotes),
    });

    entries
}

/// URL slug for a project name: lowercased, decomposed to NFD with the
/// combining diacritical marks dropped, whitespace runs replaced by `-`.
///
/// Leading and trailing whitespace also become `-`, so slugs stay identical
/// to the URLs already published for the catalog.
#[must_use]
pub fn project_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut in_whitespace = false;

    for ch in name.to_lowercase().nfd().filter(|ch| !COMBINING_DIACRITICS.contains(ch)) {
        if ch.is_whitespace() {
            if !in_whitespace {
                slug.push('-');
            }
            in_whitespace = true;
        } else {
            in_whitespace = false;
            slug.push(ch);
        }
    }

    slug
}

fn one_or_many_urls<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let urls = match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    };
    Ok(urls.into_iter().filter(|url| !url.trim().is_empty()).collect())
}

//! Catalog snapshot
//!
//! The archival job only needs a read-only view of sheets, tasks, groups,
//! users and submissions. The API layer exports that view as JSON; the job
//! re-reads it on every tick.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub id: i64,
    pub name: String,
    pub course_id: i64,
    pub due_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub sheet_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub course_id: i64,
    pub tutor_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRow {
    pub id: i64,
    pub task_id: i64,
    pub user_id: i64,
    pub group_id: i64,
    pub team_confirmed: bool,
}

/// A submission that belongs into a group's collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedSubmission {
    pub submission_id: i64,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub sheets: Vec<Sheet>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub submissions: Vec<SubmissionRow>,
}

impl Catalog {
    pub fn tasks_of_sheet(&self, sheet_id: i64) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.sheet_id == sheet_id).collect()
    }

    pub fn groups_of_course(&self, course_id: i64) -> Vec<&Group> {
        self.groups.iter().filter(|g| g.course_id == course_id).collect()
    }

    pub fn user(&self, id: i64) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    /// Team-confirmed submissions of a group for one task, one per submission id,
    /// ordered by surname, then first name.
    pub fn collected_submissions(&self, group_id: i64, task_id: i64) -> Vec<CollectedSubmission> {
        let users: HashMap<i64, &User> = self.users.iter().map(|u| (u.id, u)).collect();
        let mut seen = HashSet::new();

        let mut collected: Vec<CollectedSubmission> = self
            .submissions
            .iter()
            .filter(|s| s.group_id == group_id && s.task_id == task_id && s.team_confirmed)
            .filter(|s| seen.insert(s.id))
            .filter_map(|s| {
                let user = users.get(&s.user_id)?;
                Some(CollectedSubmission {
                    submission_id: s.id,
                    first_name: user.first_name.clone(),
                    last_name: user.last_name.clone(),
                })
            })
            .collect();

        collected.sort_by(|a, b| {
            a.last_name
                .cmp(&b.last_name)
                .then_with(|| a.first_name.cmp(&b.first_name))
                .then(a.submission_id.cmp(&b.submission_id))
        });
        collected
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("cannot read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn load(&self) -> Result<Catalog, CatalogError>;
}

/// Catalog exported to a JSON file
#[derive(Debug, Clone)]
pub struct JsonCatalog {
    path: PathBuf,
}

impl JsonCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CatalogSource for JsonCatalog {
    async fn load(&self) -> Result<Catalog, CatalogError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|source| CatalogError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[async_trait]
impl CatalogSource for Catalog {
    async fn load(&self) -> Result<Catalog, CatalogError> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64, first: &str, last: &str) -> User {
        User {
            id,
            first_name: first.to_string(),
            last_name: last.to_string(),
            email: format!("{}@uni.example", first.to_lowercase()),
        }
    }

    fn submission(id: i64, user_id: i64, confirmed: bool) -> SubmissionRow {
        SubmissionRow {
            id,
            task_id: 10,
            user_id,
            group_id: 1,
            team_confirmed: confirmed,
        }
    }

    #[test]
    fn test_collected_submissions_filters_and_orders() {
        let catalog = Catalog {
            users: vec![user(1, "Ada", "Lovelace"), user(2, "Alan", "Turing"), user(3, "Grace", "Hopper")],
            submissions: vec![
                submission(100, 2, true),
                submission(101, 1, true),
                submission(102, 3, false),
                SubmissionRow { group_id: 2, ..submission(103, 3, true) },
                SubmissionRow { task_id: 11, ..submission(104, 3, true) },
            ],
            ..Default::default()
        };

        let collected = catalog.collected_submissions(1, 10);
        let names: Vec<_> = collected.iter().map(|c| c.last_name.as_str()).collect();
        assert_eq!(names, vec!["Lovelace", "Turing"]);
    }

    #[test]
    fn test_shared_surname_ordered_by_first_name() {
        let catalog = Catalog {
            users: vec![user(1, "Zoe", "Smith"), user(2, "Ada", "Smith")],
            submissions: vec![submission(100, 1, true), submission(101, 2, true)],
            ..Default::default()
        };

        let collected = catalog.collected_submissions(1, 10);
        let order: Vec<_> = collected.iter().map(|c| (c.first_name.as_str(), c.submission_id)).collect();
        assert_eq!(order, vec![("Ada", 101), ("Zoe", 100)]);
    }

    #[test]
    fn test_team_submission_listed_once() {
        let catalog = Catalog {
            users: vec![user(1, "Ada", "Lovelace"), user(2, "Alan", "Turing")],
            // one team upload recorded for both members
            submissions: vec![submission(100, 1, true), submission(100, 2, true)],
            ..Default::default()
        };
        assert_eq!(catalog.collected_submissions(1, 10).len(), 1);
    }

    #[test]
    fn test_catalog_json_shape() {
        let raw = r#"{
            "sheets": [{"id": 1, "name": "Sheet 1", "course_id": 3, "due_at": "2026-01-01T12:00:00Z"}],
            "tasks": [{"id": 10, "sheet_id": 1}],
            "groups": [{"id": 1, "course_id": 3, "tutor_id": null}]
        }"#;
        let catalog: Catalog = serde_json::from_str(raw).unwrap();
        assert_eq!(catalog.sheets[0].name, "Sheet 1");
        assert_eq!(catalog.tasks_of_sheet(1).len(), 1);
        assert_eq!(catalog.groups_of_course(3).len(), 1);
        assert!(catalog.users.is_empty());
    }

    #[tokio::test]
    async fn test_json_catalog_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonCatalog::new(dir.path().join("missing.json"));
        assert!(matches!(source.load().await, Err(CatalogError::Io { .. })));

        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let source = JsonCatalog::new(dir.path().join("bad.json"));
        assert!(matches!(source.load().await, Err(CatalogError::Parse(_))));
    }
}

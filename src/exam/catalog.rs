//! Read-only exam catalog backed by a flat JSON file.
//!
//! The file maps `grade_<id>` keys to grades; menus and sessions use the
//! bare id. The catalog is re-read on every access so content edits show
//! up between calls, and lookups always go through grade/subject ids
//! rather than cached indices.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use log::warn;

use crate::exam::{Grade, Subject};

#[derive(serde::Deserialize)]
struct RawGrade {
    title: String,
    subjects: BTreeMap<String, serde_json::Value>,
}

pub struct ExamCatalog {
    path: PathBuf,
}

impl ExamCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Storage key for a grade. Accepts both bare ids ("3") and already
    /// prefixed ones ("grade_3").
    fn db_key(grade_id: &str) -> String {
        if grade_id.starts_with("grade_") {
            grade_id.to_string()
        } else {
            format!("grade_{}", grade_id)
        }
    }

    /// Load the whole catalog, dropping malformed entries instead of
    /// failing the load. An unreadable file yields an empty catalog.
    pub fn load(&self) -> BTreeMap<String, Grade> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                warn!("Could not read exam catalog {:?}: {}", self.path, e);
                return BTreeMap::new();
            }
        };

        let raw: BTreeMap<String, serde_json::Value> = match serde_json::from_str(&text) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Exam catalog {:?} is not valid JSON: {}", self.path, e);
                return BTreeMap::new();
            }
        };

        let mut catalog = BTreeMap::new();
        for (grade_id, value) in raw {
            let grade: RawGrade = match serde_json::from_value(value) {
                Ok(grade) => grade,
                Err(e) => {
                    warn!("Dropping malformed grade '{}': {}", grade_id, e);
                    continue;
                }
            };

            let mut subjects = BTreeMap::new();
            for (subject_id, value) in grade.subjects {
                match serde_json::from_value::<Subject>(value) {
                    Ok(subject) if Self::is_valid_subject(&subject) => {
                        subjects.insert(subject_id, subject);
                    }
                    Ok(_) => {
                        warn!(
                            "Dropping subject '{}' in grade '{}': no usable questions",
                            subject_id, grade_id
                        );
                    }
                    Err(e) => {
                        warn!(
                            "Dropping malformed subject '{}' in grade '{}': {}",
                            subject_id, grade_id, e
                        );
                    }
                }
            }

            catalog.insert(
                grade_id,
                Grade {
                    title: grade.title,
                    subjects,
                },
            );
        }

        catalog
    }

    /// A subject is offered only with a non-empty, well-formed question list.
    fn is_valid_subject(subject: &Subject) -> bool {
        !subject.questions.is_empty()
            && subject
                .questions
                .iter()
                .all(|q| q.options.len() >= 2 && q.correct_index < q.options.len())
    }

    /// All grades as (bare id, title) pairs for menu rendering.
    pub fn grades(&self) -> Vec<(String, String)> {
        self.load()
            .into_iter()
            .map(|(key, grade)| {
                let id = key.strip_prefix("grade_").unwrap_or(&key).to_string();
                (id, grade.title)
            })
            .collect()
    }

    pub fn get_grade(&self, grade_id: &str) -> Option<Grade> {
        self.load().remove(&Self::db_key(grade_id))
    }

    pub fn get_subject(&self, grade_id: &str, subject_id: &str) -> Option<Subject> {
        self.get_grade(grade_id)
            .and_then(|mut grade| grade.subjects.remove(subject_id))
    }
}

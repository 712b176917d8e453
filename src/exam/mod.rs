pub mod catalog;
pub mod engine;
pub mod error;
pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Question {
    #[serde(rename = "question")]
    pub text: String,
    pub options: Vec<String>,
    #[serde(rename = "correct")]
    pub correct_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Subject {
    pub title: String,
    pub description: String,
    #[serde(rename = "duration")]
    pub duration_minutes: u32,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Grade {
    pub title: String,
    pub subjects: BTreeMap<String, Subject>,
}

/// One user's in-progress exam. At most one exam is active per user;
/// when `exam_active` is false every other field holds its empty shape.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Session {
    pub current_grade: Option<String>,
    pub current_subject: Option<String>,
    pub current_question: usize,
    pub answers: Vec<usize>,
    pub start_time: Option<DateTime<Utc>>,
    pub exam_active: bool,
}

impl Session {
    pub fn begin(grade_id: &str, subject_id: &str) -> Self {
        Self {
            current_grade: Some(grade_id.to_string()),
            current_subject: Some(subject_id.to_string()),
            current_question: 0,
            answers: Vec::new(),
            start_time: Some(Utc::now()),
            exam_active: true,
        }
    }

    /// Back to the inactive shape, no stale state left behind.
    pub fn reset(&mut self) {
        *self = Session::default();
    }
}

/// One completed exam attempt, append-only in the user's history.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExamResult {
    pub grade_id: String,
    pub subject_id: String,
    pub exam_title: String,
    pub score: f64,
    pub correct: usize,
    pub total: usize,
    #[serde(rename = "date")]
    pub completed_at: DateTime<Utc>,
    pub answers: Vec<usize>,
}

//! The exam session engine.
//!
//! Drives one user's exam from grade/subject selection through scoring,
//! reading content from the catalog and persisting every step through the
//! session/result stores. Logical states (idle, in progress, complete)
//! are derived from the session fields; the operations here enforce the
//! transition graph between them.
//!
//! Every operation runs under a per-user lock so that two near
//! simultaneous updates (a double-tapped button, say) cannot interleave
//! their load-modify-save cycles.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use log::info;

use crate::exam::catalog::ExamCatalog;
use crate::exam::error::{ExamError, Result};
use crate::exam::store::{ResultStore, SessionStore};
use crate::exam::{ExamResult, Question, Session, Subject};

/// What the caller should show next for an active session.
pub enum Prompt {
    Question(QuestionView),
    /// All questions answered; the caller should finalize with `end`.
    EndOfExam,
}

/// One question plus its position, ready for rendering.
pub struct QuestionView {
    /// 1-based position of the question
    pub ordinal: usize,
    pub total: usize,
    pub question: Question,
}

/// Signal returned by `submit_answer`.
#[derive(Debug, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// More questions remain; ask for the next one.
    NextQuestion,
    /// That was the last question; the caller should finalize with `end`.
    Finished,
}

/// One reviewable position of a past exam.
pub struct ReviewEntry {
    /// 1-based position of the question
    pub ordinal: usize,
    pub question: String,
    pub your_answer: String,
    pub correct_answer: String,
    pub is_correct: bool,
    pub explanation: Option<String>,
}

/// A past result matched against the content existing at review time.
pub struct ReviewReport {
    pub result: ExamResult,
    pub entries: Vec<ReviewEntry>,
    /// Answered positions whose question or options no longer resolve
    pub unavailable: usize,
}

/// Aggregate statistics over a user's result history.
#[derive(Debug, Default, PartialEq)]
pub struct ProfileStats {
    pub total_exams: usize,
    pub subjects_taken: usize,
    pub average_score: f64,
    pub best_score: f64,
}

pub struct ExamEngine {
    catalog: ExamCatalog,
    sessions: SessionStore,
    results: ResultStore,
    locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl ExamEngine {
    pub fn new(catalog: ExamCatalog, sessions: SessionStore, results: ResultStore) -> Self {
        Self {
            catalog,
            sessions,
            results,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wire the three documents under one data directory, using the same
    /// file names as always: `exam_data.json`, `user_sessions.json`,
    /// `exam_results.json`.
    pub fn open(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        Self::new(
            ExamCatalog::new(dir.join("exam_data.json")),
            SessionStore::new(dir.join("user_sessions.json")),
            ResultStore::new(dir.join("exam_results.json")),
        )
    }

    fn user_lock(&self, user_id: u64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(user_id).or_default().clone()
    }

    // Catalog accessors for menu rendering.

    pub fn grades(&self) -> Vec<(String, String)> {
        self.catalog.grades()
    }

    pub fn subjects(&self, grade_id: &str) -> Option<(String, Vec<(String, Subject)>)> {
        let grade = self.catalog.get_grade(grade_id)?;
        Some((grade.title, grade.subjects.into_iter().collect()))
    }

    pub fn subject(&self, grade_id: &str, subject_id: &str) -> Option<Subject> {
        self.catalog.get_subject(grade_id, subject_id)
    }

    /// Start an exam. Rejected while another one is active for the user;
    /// the existing session is left untouched in that case.
    pub fn begin(&self, user_id: u64, grade_id: &str, subject_id: &str) -> Result<Session> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.catalog.get_subject(grade_id, subject_id).is_none() {
            return Err(ExamError::NotFound {
                grade_id: grade_id.to_string(),
                subject_id: subject_id.to_string(),
            });
        }

        if self.sessions.load(user_id).exam_active {
            return Err(ExamError::AlreadyActive);
        }

        let session = Session::begin(grade_id, subject_id);
        self.sessions.save(user_id, &session)?;
        info!(
            "User {} started exam {}/{}",
            user_id, grade_id, subject_id
        );
        Ok(session)
    }

    /// The question at the session's current index, or `EndOfExam` once
    /// the index has run past the question list.
    pub fn current_question(&self, user_id: u64) -> Result<Prompt> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let session = self.sessions.load(user_id);
        let (_, subject) = self.resolve_subject(&session)?;

        match subject.questions.get(session.current_question) {
            Some(question) => Ok(Prompt::Question(QuestionView {
                ordinal: session.current_question + 1,
                total: subject.questions.len(),
                question: question.clone(),
            })),
            None => Ok(Prompt::EndOfExam),
        }
    }

    /// Record one answer and advance. The option index comes straight
    /// from a user action and is validated against the current question
    /// before anything is persisted.
    pub fn submit_answer(&self, user_id: u64, option_index: usize) -> Result<AnswerOutcome> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut session = self.sessions.load(user_id);
        let (_, subject) = self.resolve_subject(&session)?;

        let question = match subject.questions.get(session.current_question) {
            Some(question) => question,
            // Already past the last question, nothing left to record.
            None => return Ok(AnswerOutcome::Finished),
        };

        if option_index >= question.options.len() {
            return Err(ExamError::OutOfRange {
                given: option_index,
                options: question.options.len(),
            });
        }

        session.answers.push(option_index);
        session.current_question += 1;
        self.sessions.save(user_id, &session)?;

        if session.current_question >= subject.questions.len() {
            Ok(AnswerOutcome::Finished)
        } else {
            Ok(AnswerOutcome::NextQuestion)
        }
    }

    /// The single finalization path: score the answers given so far,
    /// append the result to the user's history and reset the session.
    /// Safe to call whether the exam ran to completion or was cut short.
    pub fn end(&self, user_id: u64) -> Result<ExamResult> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut session = self.sessions.load(user_id);
        let (grade_title, subject) = self.resolve_subject(&session)?;

        let questions = &subject.questions;
        let correct = session
            .answers
            .iter()
            .enumerate()
            .filter(|(i, answer)| {
                questions
                    .get(*i)
                    .map(|q| q.correct_index == **answer)
                    .unwrap_or(false)
            })
            .count();
        let total = session.answers.len();
        let score = if total > 0 {
            correct as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let result = ExamResult {
            grade_id: session.current_grade.clone().unwrap_or_default(),
            subject_id: session.current_subject.clone().unwrap_or_default(),
            exam_title: format!("{} - {}", grade_title, subject.title),
            score,
            correct,
            total,
            completed_at: Utc::now(),
            answers: session.answers.clone(),
        };

        self.results.append(user_id, result.clone())?;
        session.reset();
        self.sessions.save(user_id, &session)?;

        info!(
            "User {} finished exam {}/{}: {}/{} correct",
            user_id, result.grade_id, result.subject_id, correct, total
        );
        Ok(result)
    }

    /// Match a past result against the content as it exists now.
    /// Positions whose question or chosen option no longer resolve are
    /// counted as unavailable rather than failing the whole review.
    pub fn review(&self, user_id: u64, result_index: usize) -> Result<ReviewReport> {
        let history = self.results.load(user_id);
        let result = history
            .get(result_index)
            .cloned()
            .ok_or(ExamError::IndexOutOfRange {
                given: result_index,
                len: history.len(),
            })?;

        let subject = self
            .catalog
            .get_subject(&result.grade_id, &result.subject_id)
            .ok_or_else(|| ExamError::ContentMissing {
                grade_id: result.grade_id.clone(),
                subject_id: result.subject_id.clone(),
            })?;

        let mut entries = Vec::new();
        let mut unavailable = 0;
        for (i, &answer) in result.answers.iter().enumerate() {
            let question = match subject.questions.get(i) {
                Some(question) => question,
                None => {
                    unavailable += 1;
                    continue;
                }
            };
            let (your_answer, correct_answer) = match (
                question.options.get(answer),
                question.options.get(question.correct_index),
            ) {
                (Some(yours), Some(correct)) => (yours.clone(), correct.clone()),
                _ => {
                    unavailable += 1;
                    continue;
                }
            };

            entries.push(ReviewEntry {
                ordinal: i + 1,
                question: question.text.clone(),
                your_answer,
                correct_answer,
                is_correct: answer == question.correct_index,
                explanation: question.explanation.clone(),
            });
        }

        Ok(ReviewReport {
            result,
            entries,
            unavailable,
        })
    }

    /// The user's full result history in completion order.
    pub fn history(&self, user_id: u64) -> Vec<ExamResult> {
        self.results.load(user_id)
    }

    pub fn profile(&self, user_id: u64) -> ProfileStats {
        let history = self.results.load(user_id);
        if history.is_empty() {
            return ProfileStats::default();
        }

        let subjects: HashSet<(&str, &str)> = history
            .iter()
            .map(|r| (r.grade_id.as_str(), r.subject_id.as_str()))
            .collect();

        ProfileStats {
            total_exams: history.len(),
            subjects_taken: subjects.len(),
            average_score: history.iter().map(|r| r.score).sum::<f64>() / history.len() as f64,
            best_score: history.iter().map(|r| r.score).fold(0.0, f64::max),
        }
    }

    /// Throw away whatever session the user has, active or not.
    pub fn reset(&self, user_id: u64) -> Result<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.sessions.save(user_id, &Session::default())
    }

    /// Read-only scan for the reminder job.
    pub fn users_with_active_exam(&self) -> Vec<u64> {
        self.sessions.active_users()
    }

    /// Resolve the session's grade/subject against the catalog. An
    /// inactive session is `NoActiveSession`; an active one whose content
    /// vanished is `ContentMissing`.
    fn resolve_subject(&self, session: &Session) -> Result<(String, Subject)> {
        if !session.exam_active {
            return Err(ExamError::NoActiveSession);
        }
        let (grade_id, subject_id) = match (&session.current_grade, &session.current_subject) {
            (Some(grade_id), Some(subject_id)) => (grade_id, subject_id),
            _ => return Err(ExamError::NoActiveSession),
        };

        let grade = self
            .catalog
            .get_grade(grade_id)
            .ok_or_else(|| ExamError::ContentMissing {
                grade_id: grade_id.clone(),
                subject_id: subject_id.clone(),
            })?;
        let subject =
            grade
                .subjects
                .get(subject_id)
                .cloned()
                .ok_or_else(|| ExamError::ContentMissing {
                    grade_id: grade_id.clone(),
                    subject_id: subject_id.clone(),
                })?;
        Ok((grade.title, subject))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    // grade "3" / "math": two questions with correct indices [1, 0]
    const CATALOG: &str = r#"{
        "grade_3": {
            "title": "Grade 3",
            "subjects": {
                "math": {
                    "title": "Mathematics",
                    "description": "Basic arithmetic",
                    "duration": 10,
                    "questions": [
                        {"question": "1+1?", "options": ["1", "2"], "correct": 1},
                        {"question": "2-1?", "options": ["1", "2"], "correct": 0,
                         "explanation": "Two minus one is one."}
                    ]
                },
                "reading": {
                    "title": "Reading",
                    "description": "Comprehension",
                    "duration": 15,
                    "questions": [
                        {"question": "q1", "options": ["a", "b", "c"], "correct": 2},
                        {"question": "q2", "options": ["a", "b", "c"], "correct": 0},
                        {"question": "q3", "options": ["a", "b", "c"], "correct": 1},
                        {"question": "q4", "options": ["a", "b", "c"], "correct": 1}
                    ]
                }
            }
        }
    }"#;

    fn engine() -> (ExamEngine, TempDir) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("exam_data.json"), CATALOG).unwrap();
        (ExamEngine::open(dir.path()), dir)
    }

    #[test]
    fn test_full_run_all_correct() {
        let (engine, _dir) = engine();
        engine.begin(1, "3", "math").unwrap();

        assert_eq!(engine.submit_answer(1, 1).unwrap(), AnswerOutcome::NextQuestion);
        assert_eq!(engine.submit_answer(1, 0).unwrap(), AnswerOutcome::Finished);

        let result = engine.end(1).unwrap();
        assert_eq!(result.correct, 2);
        assert_eq!(result.total, 2);
        assert_eq!(result.score, 100.0);
        assert_eq!(result.exam_title, "Grade 3 - Mathematics");
    }

    #[test]
    fn test_full_run_half_correct() {
        let (engine, _dir) = engine();
        engine.begin(1, "3", "math").unwrap();
        engine.submit_answer(1, 0).unwrap();
        engine.submit_answer(1, 0).unwrap();

        let result = engine.end(1).unwrap();
        assert_eq!(result.correct, 1);
        assert_eq!(result.total, 2);
        assert_eq!(result.score, 50.0);
    }

    #[test]
    fn test_three_of_four_is_75() {
        let (engine, _dir) = engine();
        engine.begin(1, "3", "reading").unwrap();
        for answer in [2, 0, 1, 2] {
            engine.submit_answer(1, answer).unwrap();
        }

        let result = engine.end(1).unwrap();
        assert_eq!(result.correct, 3);
        assert_eq!(result.total, 4);
        assert_eq!(result.score, 75.0);
    }

    #[test]
    fn test_end_with_no_answers_scores_zero() {
        let (engine, _dir) = engine();
        engine.begin(1, "3", "math").unwrap();

        let result = engine.end(1).unwrap();
        assert_eq!(result.total, 0);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_begin_unknown_grade_or_subject() {
        let (engine, _dir) = engine();
        assert!(matches!(
            engine.begin(1, "9", "math"),
            Err(ExamError::NotFound { .. })
        ));
        assert!(matches!(
            engine.begin(1, "3", "history"),
            Err(ExamError::NotFound { .. })
        ));
    }

    #[test]
    fn test_begin_while_active_fails_and_keeps_session() {
        let (engine, _dir) = engine();
        engine.begin(1, "3", "math").unwrap();
        engine.submit_answer(1, 1).unwrap();

        assert!(matches!(
            engine.begin(1, "3", "reading"),
            Err(ExamError::AlreadyActive)
        ));

        // the in-flight exam is untouched
        match engine.current_question(1).unwrap() {
            Prompt::Question(view) => {
                assert_eq!(view.ordinal, 2);
                assert_eq!(view.total, 2);
                assert_eq!(view.question.text, "2-1?");
            }
            Prompt::EndOfExam => panic!("expected a question"),
        }
    }

    #[test]
    fn test_out_of_range_answer_changes_nothing() {
        let (engine, _dir) = engine();
        engine.begin(1, "3", "math").unwrap();

        assert!(matches!(
            engine.submit_answer(1, 5),
            Err(ExamError::OutOfRange { given: 5, options: 2 })
        ));

        match engine.current_question(1).unwrap() {
            Prompt::Question(view) => assert_eq!(view.ordinal, 1),
            Prompt::EndOfExam => panic!("expected the first question"),
        }
    }

    #[test]
    fn test_operations_without_active_session() {
        let (engine, _dir) = engine();
        assert!(matches!(
            engine.current_question(1),
            Err(ExamError::NoActiveSession)
        ));
        assert!(matches!(
            engine.submit_answer(1, 0),
            Err(ExamError::NoActiveSession)
        ));
        assert!(matches!(engine.end(1), Err(ExamError::NoActiveSession)));
    }

    #[test]
    fn test_end_resets_session_and_extends_history() {
        let (engine, _dir) = engine();
        engine.begin(1, "3", "math").unwrap();
        engine.submit_answer(1, 1).unwrap();
        engine.end(1).unwrap();

        assert!(matches!(
            engine.current_question(1),
            Err(ExamError::NoActiveSession)
        ));
        assert_eq!(engine.history(1).len(), 1);

        // a new exam can start right away
        engine.begin(1, "3", "math").unwrap();
    }

    #[test]
    fn test_end_of_exam_prompt_after_last_answer() {
        let (engine, _dir) = engine();
        engine.begin(1, "3", "math").unwrap();
        engine.submit_answer(1, 1).unwrap();
        engine.submit_answer(1, 0).unwrap();

        assert!(matches!(
            engine.current_question(1).unwrap(),
            Prompt::EndOfExam
        ));
        // a replayed submit past the end records nothing
        assert_eq!(engine.submit_answer(1, 0).unwrap(), AnswerOutcome::Finished);
        assert_eq!(engine.end(1).unwrap().total, 2);
    }

    #[test]
    fn test_review_reproduces_recorded_answers() {
        let (engine, _dir) = engine();
        engine.begin(1, "3", "math").unwrap();
        engine.submit_answer(1, 0).unwrap();
        engine.submit_answer(1, 0).unwrap();
        engine.end(1).unwrap();

        let report = engine.review(1, 0).unwrap();
        assert_eq!(report.result.answers, vec![0, 0]);
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.unavailable, 0);

        assert!(!report.entries[0].is_correct);
        assert_eq!(report.entries[0].your_answer, "1");
        assert_eq!(report.entries[0].correct_answer, "2");

        assert!(report.entries[1].is_correct);
        assert_eq!(
            report.entries[1].explanation.as_deref(),
            Some("Two minus one is one.")
        );
    }

    #[test]
    fn test_review_index_out_of_range() {
        let (engine, _dir) = engine();
        assert!(matches!(
            engine.review(1, 0),
            Err(ExamError::IndexOutOfRange { given: 0, len: 0 })
        ));
    }

    #[test]
    fn test_content_vanishing_mid_session() {
        let (engine, dir) = engine();
        engine.begin(1, "3", "math").unwrap();
        engine.submit_answer(1, 1).unwrap();

        fs::write(dir.path().join("exam_data.json"), "{}").unwrap();

        assert!(matches!(
            engine.current_question(1),
            Err(ExamError::ContentMissing { .. })
        ));
        assert!(matches!(
            engine.submit_answer(1, 0),
            Err(ExamError::ContentMissing { .. })
        ));
    }

    #[test]
    fn test_review_degrades_when_question_list_shrank() {
        let (engine, dir) = engine();
        engine.begin(1, "3", "math").unwrap();
        engine.submit_answer(1, 1).unwrap();
        engine.submit_answer(1, 0).unwrap();
        engine.end(1).unwrap();

        // same subject, now down to a single question
        let shrunk = r#"{
            "grade_3": {
                "title": "Grade 3",
                "subjects": {
                    "math": {
                        "title": "Mathematics",
                        "description": "Basic arithmetic",
                        "duration": 10,
                        "questions": [
                            {"question": "1+1?", "options": ["1", "2"], "correct": 1}
                        ]
                    }
                }
            }
        }"#;
        fs::write(dir.path().join("exam_data.json"), shrunk).unwrap();

        let report = engine.review(1, 0).unwrap();
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.unavailable, 1);
    }

    #[test]
    fn test_profile_aggregates() {
        let (engine, _dir) = engine();
        assert_eq!(engine.profile(1), ProfileStats::default());

        engine.begin(1, "3", "math").unwrap();
        engine.submit_answer(1, 1).unwrap();
        engine.submit_answer(1, 0).unwrap();
        engine.end(1).unwrap(); // 100.0

        engine.begin(1, "3", "math").unwrap();
        engine.submit_answer(1, 0).unwrap();
        engine.submit_answer(1, 0).unwrap();
        engine.end(1).unwrap(); // 50.0

        let stats = engine.profile(1);
        assert_eq!(stats.total_exams, 2);
        assert_eq!(stats.subjects_taken, 1);
        assert_eq!(stats.average_score, 75.0);
        assert_eq!(stats.best_score, 100.0);
    }

    #[test]
    fn test_reset_clears_active_session() {
        let (engine, _dir) = engine();
        engine.begin(1, "3", "math").unwrap();
        engine.reset(1).unwrap();

        assert!(matches!(
            engine.current_question(1),
            Err(ExamError::NoActiveSession)
        ));
        assert!(engine.users_with_active_exam().is_empty());
    }

    #[test]
    fn test_sessions_are_per_user() {
        let (engine, _dir) = engine();
        engine.begin(1, "3", "math").unwrap();
        engine.begin(2, "3", "reading").unwrap();

        engine.submit_answer(1, 1).unwrap();

        match engine.current_question(2).unwrap() {
            Prompt::Question(view) => {
                assert_eq!(view.ordinal, 1);
                assert_eq!(view.total, 4);
            }
            Prompt::EndOfExam => panic!("expected user 2's first question"),
        }

        let mut active = engine.users_with_active_exam();
        active.sort();
        assert_eq!(active, vec![1, 2]);
    }
}

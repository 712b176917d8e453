//! Flat-file persistence for sessions and results.
//!
//! Each store is one JSON document mapping user id to that user's data.
//! Reads are tolerant: a missing or unreadable document degrades to the
//! empty shape. Writes go through a temp file and rename, and failures
//! surface to the caller since a silently dropped answer is a
//! correctness problem.

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::exam::error::Result;
use crate::exam::{ExamResult, Session};

/// One JSON document on disk, read whole and written whole.
struct JsonDocument {
    path: PathBuf,
}

impl JsonDocument {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.json".to_string());
        name.push_str(".tmp");
        self.path.with_file_name(format!(".{}", name))
    }

    /// Read the full map, treating any failure as an empty document.
    fn read<T: DeserializeOwned>(&self) -> HashMap<u64, T> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                warn!("Could not open {:?}: {}", self.path, e);
                return HashMap::new();
            }
        };

        match serde_json::from_reader(BufReader::new(file)) {
            Ok(map) => map,
            Err(e) => {
                warn!("Could not parse {:?}: {}", self.path, e);
                HashMap::new()
            }
        }
    }

    /// Write the full map atomically (temp file, then rename).
    fn write<T: Serialize>(&self, map: &HashMap<u64, T>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.temp_path();
        let file = fs::File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, map)?;
        writer.flush()?;

        fs::rename(&temp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            e
        })?;
        Ok(())
    }
}

/// Per-user in-progress exam sessions.
pub struct SessionStore {
    doc: JsonDocument,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            doc: JsonDocument::new(path.into()),
        }
    }

    /// The user's session, or the inactive default if none is stored.
    pub fn load(&self, user_id: u64) -> Session {
        self.doc
            .read::<Session>()
            .remove(&user_id)
            .unwrap_or_default()
    }

    pub fn save(&self, user_id: u64, session: &Session) -> Result<()> {
        let mut sessions = self.doc.read::<Session>();
        sessions.insert(user_id, session.clone());
        self.doc.write(&sessions)
    }

    /// Users with an exam still in progress. Read-only, used by the
    /// reminder job.
    pub fn active_users(&self) -> Vec<u64> {
        self.doc
            .read::<Session>()
            .into_iter()
            .filter(|(_, session)| session.exam_active)
            .map(|(user_id, _)| user_id)
            .collect()
    }
}

/// Per-user append-only history of completed exams.
pub struct ResultStore {
    doc: JsonDocument,
}

impl ResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            doc: JsonDocument::new(path.into()),
        }
    }

    /// The user's history in completion order, empty if none is stored.
    pub fn load(&self, user_id: u64) -> Vec<ExamResult> {
        self.doc
            .read::<Vec<ExamResult>>()
            .remove(&user_id)
            .unwrap_or_default()
    }

    pub fn append(&self, user_id: u64, result: ExamResult) -> Result<()> {
        let mut results = self.doc.read::<Vec<ExamResult>>();
        results.entry(user_id).or_default().push(result);
        self.doc.write(&results)
    }
}

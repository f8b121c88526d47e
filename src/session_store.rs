//! Action history persistence.
//!
//! One `<name>.jsonl` file per instruction or recording, one action per line.
//! Loading is lenient: older files may lack params the validator now requires.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use log::warn;

use crate::action_schema::{validate_action, Action, Strictness};

const MAX_LISTED: usize = 100;

pub struct HistoryStore {
    base_dir: PathBuf,
}

impl HistoryStore {
    pub fn new(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir)
            .with_context(|| format!("Failed to create history directory {:?}", base_dir))?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    pub fn save(&self, name: &str, actions: &[Action]) -> Result<PathBuf> {
        let path = self.path_for(name);
        let mut file = fs::File::create(&path)
            .with_context(|| format!("Failed to create history file {:?}", path))?;
        for action in actions {
            let line = serde_json::to_string(action)?;
            writeln!(file, "{}", line)?;
        }
        file.flush()?;
        Ok(path)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    /// Missing files are an empty history; malformed lines are skipped.
    pub fn load(&self, name: &str) -> Result<Vec<Action>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read history file {:?}", path))?;

        let mut actions = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<serde_json::Value>(line)
                .map_err(anyhow::Error::from)
                .and_then(|value| validate_action(&value, Strictness::Lenient).map_err(anyhow::Error::from));
            match parsed {
                Ok(action) => actions.push(action),
                Err(e) => warn!("Skipping line {} of {:?}: {}", lineno + 1, path, e),
            }
        }
        Ok(actions)
    }

    /// Stored names, most recently modified first.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut entries: Vec<(SystemTime, String)> = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((modified, stem.to_string()));
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(entries.into_iter().take(MAX_LISTED).map(|(_, name)| name).collect())
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name);
        if path.exists() {
            fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.jsonl", sanitize_name(name)))
    }
}

/// Maps an instruction or recording name onto a safe file stem.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(120)
        .collect();
    let cleaned = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace()).to_string();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    }
}

//! Append-only newline-delimited JSON stores.
//!
//! Every store is read leniently (unreadable lines are skipped with a
//! warning) and written by appending whole lines. The output store of a
//! running stage has exactly one writer task, fed over a channel.

use crate::core::{OutputEntry, Record};
use crate::errors::{display_key, ConfigError, RefineflowError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A line-oriented JSON file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonlStore {
    path: PathBuf,
}

impl JsonlStore {
    /// Creates a handle for `path`. The file need not exist.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the file exists.
    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Reads every parseable line. A missing file reads as empty.
    pub async fn read<T: DeserializeOwned>(&self) -> Result<Vec<T>, RefineflowError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_lines(&self.path, &text))
    }

    /// Reads the file, failing if it does not exist.
    pub async fn read_required<T: DeserializeOwned>(&self) -> Result<Vec<T>, RefineflowError> {
        if !self.exists().await {
            return Err(ConfigError::MissingInput {
                path: self.path.clone(),
            }
            .into());
        }
        self.read().await
    }

    /// Reads output entries.
    pub async fn read_entries(&self) -> Result<Vec<OutputEntry>, RefineflowError> {
        self.read().await
    }

    /// Keys of all work items already present in the store.
    pub async fn completed_keys(&self) -> Result<HashSet<String>, RefineflowError> {
        Ok(self
            .read_entries()
            .await?
            .iter()
            .map(|entry| entry.key().to_string())
            .collect())
    }

    /// Appends items as JSON lines.
    pub async fn append<T: Serialize>(&self, items: &[T]) -> Result<(), RefineflowError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for item in items {
            serde_json::to_writer(&mut buf, item)?;
            buf.push(b'\n');
        }
        let mut file = self.open_append().await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }

    /// Opens the file for appending, creating it and its directory as needed.
    ///
    /// If the last line was torn by a crash, a newline is written first so
    /// the next entry starts on a fresh line.
    pub async fn open_append(&self) -> std::io::Result<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let torn = ends_without_newline(&self.path).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        if torn {
            warn!(path = %self.path.display(), "Repairing torn last line");
            file.write_all(b"\n").await?;
        }
        Ok(file)
    }
}

fn parse_lines<T: DeserializeOwned>(path: &Path, text: &str) -> Vec<T> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| match serde_json::from_str(line) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = idx + 1,
                    error = %e,
                    "Skipping unreadable line"
                );
                None
            }
        })
        .collect()
}

async fn ends_without_newline(path: &Path) -> std::io::Result<bool> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if file.metadata().await?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

/// An entry that could not be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    /// Key of the lost entry.
    pub key: String,
    /// Why the write failed.
    pub error: String,
}

/// What the writer task did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterReport {
    /// Entries appended and flushed.
    pub written: usize,
    /// Entries lost to write errors.
    pub failures: Vec<WriteFailure>,
}

/// Spawns the single writer task for `store`.
///
/// The task appends one line per received entry and flushes after each, then
/// reports when the channel closes. A failed write loses only that entry.
/// `on_written` runs after each durable write with the number written so far.
pub fn spawn_writer<F>(
    store: JsonlStore,
    mut rx: mpsc::Receiver<OutputEntry>,
    mut on_written: F,
) -> JoinHandle<WriterReport>
where
    F: FnMut(&OutputEntry, usize) + Send + 'static,
{
    tokio::spawn(async move {
        let mut report = WriterReport::default();
        let mut file = match store.open_append().await {
            Ok(file) => Some(file),
            Err(e) => {
                error!(path = %store.path().display(), error = %e, "Cannot open output store");
                None
            }
        };

        while let Some(entry) = rx.recv().await {
            let result = match file.as_mut() {
                Some(file) => write_entry(file, &entry).await,
                None => Err(RefineflowError::Internal("output store is not open".to_string())),
            };
            match result {
                Ok(()) => {
                    report.written += 1;
                    debug!(key = %display_key(entry.key()), "Entry written");
                    on_written(&entry, report.written);
                }
                Err(e) => {
                    error!(key = %display_key(entry.key()), error = %e, "Failed to write entry");
                    report.failures.push(WriteFailure {
                        key: entry.key().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    })
}

async fn write_entry(file: &mut File, entry: &OutputEntry) -> Result<(), RefineflowError> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

#[derive(Deserialize)]
struct Annotation {
    input_values: serde_json::Map<String, serde_json::Value>,
}

/// Loads human-annotation exports: a JSON array of `{input_values: {...}}`.
///
/// `refinement` is read as `refine`.
pub async fn load_annotation_records(path: &Path) -> Result<Vec<Record>, RefineflowError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::MissingInput {
                path: path.to_path_buf(),
            }
            .into())
        }
        Err(e) => return Err(e.into()),
    };
    let annotations: Vec<Annotation> = serde_json::from_str(&text)?;
    annotations
        .into_iter()
        .map(|annotation| {
            let mut values = annotation.input_values;
            if !values.contains_key("refine") {
                if let Some(refinement) = values.remove("refinement") {
                    values.insert("refine".to_string(), refinement);
                }
            }
            serde_json::from_value(serde_json::Value::Object(values)).map_err(Into::into)
        })
        .collect()
}

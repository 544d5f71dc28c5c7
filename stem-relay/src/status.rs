//! Per-file status and error records.
//!
//! A record lives in a hash under `file:{filename}` and holds the fields
//! `status`, `error`, `updated_at` plus any auxiliary fields written by stages.
//! Every operation is best-effort: backend failures are logged and replaced
//! with a safe default so the pipeline keeps running without observability.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, warn};

use crate::backend::{Degrade, KeyValueBackend};
use crate::retry::RetryCounter;
use crate::utils::filename::sanitize_filename;

const KEY_PREFIX: &str = "file:";
const FIELD_STATUS: &str = "status";
const FIELD_ERROR: &str = "error";
const FIELD_UPDATED_AT: &str = "updated_at";
const RESERVED_FIELDS: &[&str] = &[FIELD_STATUS, FIELD_ERROR, FIELD_UPDATED_AT];

/// Processing status of a file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FileStatus {
    Queued,
    Processing,
    Done,
    Error,
    /// Reported when no record exists or it cannot be read. Never stored.
    Unknown,
}

fn record_key(filename: &str) -> String {
    format!("{KEY_PREFIX}{filename}")
}

/// Summary returned by [`StatusStore::get_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatusReport {
    pub filename: String,
    pub status: FileStatus,
    /// Last failure detail; empty when the file is not in error.
    pub last_error: String,
}

/// Full stored record of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub status: FileStatus,
    pub error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub extra: BTreeMap<String, String>,
}

impl FileRecord {
    fn from_fields(filename: &str, mut fields: HashMap<String, String>) -> Self {
        let status = fields
            .remove(FIELD_STATUS)
            .and_then(|raw| FileStatus::from_str(&raw).ok())
            .unwrap_or(FileStatus::Unknown);
        let error = fields.remove(FIELD_ERROR);
        let updated_at = fields
            .remove(FIELD_UPDATED_AT)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Self {
            filename: filename.to_string(),
            status,
            error,
            updated_at,
            extra: fields.into_iter().collect(),
        }
    }
}

/// A status write: the new status plus optional error detail and extra fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: FileStatus,
    pub error: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl StatusUpdate {
    pub fn new(status: FileStatus) -> Self {
        Self {
            status,
            error: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn with_extras<I, K, V>(mut self, extras: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.extra
            .extend(extras.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

/// Keyed store of [`FileRecord`]s.
#[derive(Clone)]
pub struct StatusStore {
    backend: Arc<dyn KeyValueBackend>,
    counters: RetryCounter,
}

impl StatusStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            counters: RetryCounter::new(backend.clone()),
            backend,
        }
    }

    /// Set only the status of a file.
    pub async fn set_status(&self, filename: &str, status: FileStatus) {
        self.update(filename, StatusUpdate::new(status)).await;
    }

    /// Mark a file as failed with the given detail.
    pub async fn set_error(&self, filename: &str, error: impl Into<String>) {
        self.update(filename, StatusUpdate::new(FileStatus::Error).with_error(error))
            .await;
    }

    /// Upsert a record.
    ///
    /// `error` is written only together with [`FileStatus::Error`]; any other
    /// status removes a previously stored error. Extra fields are merged.
    pub async fn update(&self, filename: &str, update: StatusUpdate) {
        if update.status == FileStatus::Unknown {
            warn!(filename, "Refusing to store the unknown status");
            return;
        }

        let filename = sanitize_filename(filename);
        let key = record_key(&filename);

        let mut fields = vec![
            (FIELD_STATUS.to_string(), update.status.to_string()),
            (FIELD_UPDATED_AT.to_string(), Utc::now().to_rfc3339()),
        ];

        match (update.status, update.error) {
            (FileStatus::Error, Some(error)) => fields.push((FIELD_ERROR.to_string(), error)),
            (_, Some(_)) => {
                debug!(filename = %filename, status = %update.status, "Ignoring error detail for non-error status");
            }
            _ => {}
        }

        for (name, value) in update.extra {
            if RESERVED_FIELDS.contains(&name.as_str()) {
                warn!(filename = %filename, field = %name, "Ignoring reserved extra field");
                continue;
            }
            fields.push((name, value));
        }

        self.backend
            .hash_set(&key, &fields)
            .await
            .or_degrade("status.update", ());

        if update.status != FileStatus::Error {
            self.backend
                .hash_delete(&key, FIELD_ERROR)
                .await
                .or_degrade("status.clear_error_field", ());
        }
    }

    /// Status and last error of a file. `unknown` when there is no record.
    pub async fn get_status(&self, filename: &str) -> FileStatusReport {
        let filename = sanitize_filename(filename);

        match self.backend.hash_get_all(&record_key(&filename)).await {
            Ok(fields) => {
                let record = FileRecord::from_fields(&filename, fields);
                FileStatusReport {
                    filename,
                    status: record.status,
                    last_error: record.error.unwrap_or_default(),
                }
            }
            Err(e) => {
                warn!(filename = %filename, error = %e, "Failed to read file status");
                FileStatusReport {
                    filename,
                    status: FileStatus::Unknown,
                    last_error: e.to_string(),
                }
            }
        }
    }

    /// The full record, or `None` when absent or unreadable.
    pub async fn get_record(&self, filename: &str) -> Option<FileRecord> {
        let filename = sanitize_filename(filename);
        let fields = self
            .backend
            .hash_get_all(&record_key(&filename))
            .await
            .or_degrade("status.get_record", HashMap::new());

        if fields.is_empty() {
            None
        } else {
            Some(FileRecord::from_fields(&filename, fields))
        }
    }

    async fn scan(&self) -> Vec<FileRecord> {
        let keys = self
            .backend
            .keys_with_prefix(KEY_PREFIX)
            .await
            .or_degrade("status.scan", Vec::new());

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(filename) = key.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            match self.backend.hash_get_all(&key).await {
                Ok(fields) if !fields.is_empty() => {
                    records.push(FileRecord::from_fields(filename, fields));
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(key = %key, error = %e, "Skipping unreadable record during scan");
                }
            }
        }
        records
    }

    /// Filenames currently in `status`.
    ///
    /// A full scan; results may be slightly stale under concurrent writers.
    pub async fn list_by_status(&self, status: FileStatus) -> BTreeSet<String> {
        self.scan()
            .await
            .into_iter()
            .filter(|record| record.status == status)
            .map(|record| record.filename)
            .collect()
    }

    /// Records in `status` that have not changed for at least `older_than`.
    pub async fn stale(&self, status: FileStatus, older_than: Duration) -> Vec<FileRecord> {
        let threshold = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let mut records: Vec<FileRecord> = self
            .scan()
            .await
            .into_iter()
            .filter(|record| record.status == status)
            .filter(|record| {
                record
                    .updated_at
                    .is_some_and(|ts| now.signed_duration_since(ts) >= threshold)
            })
            .collect();
        records.sort_by_key(|record| record.updated_at);
        records
    }

    /// Put a failed file back to `queued` with a fresh retry budget.
    pub async fn clear_error(&self, filename: &str) {
        let filename = sanitize_filename(filename);
        let key = record_key(&filename);

        let fields = [
            (FIELD_STATUS.to_string(), FileStatus::Queued.to_string()),
            (FIELD_UPDATED_AT.to_string(), Utc::now().to_rfc3339()),
        ];
        self.backend
            .hash_set(&key, &fields)
            .await
            .or_degrade("status.clear_error", ());

        self.counters.reset_all(&filename).await;

        self.backend
            .hash_delete(&key, FIELD_ERROR)
            .await
            .or_degrade("status.clear_error_field", ());
    }
}

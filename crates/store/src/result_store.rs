//! Write-once, read-many result cache for one session.
//!
//! Layout under the session directory:
//!
//! ```text
//! results/{result_id}/meta.json   # summary, read without touching rows
//! results/{result_id}/rows.json   # full result set body
//! results/{result_id}/rows.csv    # flat projection for export
//! tmp/                            # staging; invisible to readers
//! ```
//!
//! A result is staged under `tmp/` and renamed into `results/` in one step,
//! so readers and the eviction scan only ever see complete entries.
//! Published entries are immutable: they are replaced never, removed only
//! by eviction or explicit delete.

use brapi_protocol::{Record, ResultSet, ResultSummary, unix_now};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::csv::render_csv;
use crate::error::{Result, StoreError};

/// Observed default retention window for cached results.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 86_400);

const RESULTS_DIR: &str = "results";
const STAGING_DIR: &str = "tmp";
const META_FILE: &str = "meta.json";
const ROWS_FILE: &str = "rows.json";
const CSV_FILE: &str = "rows.csv";

/// Projected, sliced view returned by `load`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LoadedRows {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

pub struct ResultStore {
    session_dir: PathBuf,
}

impl ResultStore {
    pub fn open(session_dir: impl Into<PathBuf>) -> Result<Self> {
        let session_dir = session_dir.into();
        std::fs::create_dir_all(session_dir.join(RESULTS_DIR))?;
        std::fs::create_dir_all(session_dir.join(STAGING_DIR))?;
        Ok(Self { session_dir })
    }

    /// Publish an assembled result. Write-once: a second `put` under the
    /// same id is rejected, and concurrent `put`s of distinct ids share no
    /// files to contend on.
    pub fn put(&self, set: &ResultSet) -> Result<ResultSummary> {
        validate_result_id(&set.result_id)?;
        let published = self.result_dir(&set.result_id);
        if published.exists() {
            return Err(StoreError::DuplicateResult(set.result_id.clone()));
        }

        let staging = self
            .session_dir
            .join(STAGING_DIR)
            .join(format!("{}.{}", set.result_id, nonce()));
        std::fs::create_dir_all(&staging)?;

        let outcome = self.stage(set, &staging).and_then(|summary| {
            match std::fs::rename(&staging, &published) {
                Ok(()) => Ok(summary),
                // Lost a race against an identical id: the published entry
                // wins, this staging attempt is discarded.
                Err(err)
                    if published.exists() =>
                {
                    log::debug!(
                        "Publish race on {}: {err}; keeping the existing entry",
                        set.result_id
                    );
                    Err(StoreError::DuplicateResult(set.result_id.clone()))
                }
                Err(err) => Err(err.into()),
            }
        });

        if outcome.is_err() {
            let _ = std::fs::remove_dir_all(&staging);
        }
        outcome
    }

    fn stage(&self, set: &ResultSet, staging: &Path) -> Result<ResultSummary> {
        let rows_bytes = serde_json::to_vec(set)?;
        let summary = ResultSummary::of(set, rows_bytes.len() as u64);
        std::fs::write(staging.join(ROWS_FILE), &rows_bytes)?;
        std::fs::write(staging.join(META_FILE), serde_json::to_vec_pretty(&summary)?)?;
        std::fs::write(staging.join(CSV_FILE), render_csv(&set.columns, &set.rows))?;
        log::info!(
            "Cached result {} ({} rows, {} columns)",
            set.result_id,
            set.returned_count,
            set.columns.len()
        );
        Ok(summary)
    }

    /// Summary without materializing row data.
    pub fn get_summary(&self, result_id: &str) -> Result<ResultSummary> {
        validate_result_id(result_id)?;
        let bytes = read_entry_file(&self.result_dir(result_id).join(META_FILE), result_id)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Projected and sliced rows. Unknown columns fail; an offset past the
    /// end returns an empty set. Identical arguments always return an
    /// identical view: published entries never change.
    pub fn load(
        &self,
        result_id: &str,
        columns: Option<&[String]>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<LoadedRows> {
        validate_result_id(result_id)?;
        let bytes = read_entry_file(&self.result_dir(result_id).join(ROWS_FILE), result_id)?;
        let set: ResultSet = serde_json::from_slice(&bytes)?;

        let projection: Vec<String> = match columns {
            Some(requested) => {
                for column in requested {
                    if !set.columns.contains(column) {
                        return Err(StoreError::UnknownColumn(column.clone()));
                    }
                }
                requested.to_vec()
            }
            None => set.columns.clone(),
        };

        let rows = set
            .rows
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .map(|row| {
                projection
                    .iter()
                    .map(|column| {
                        let value = row.get(column).cloned().unwrap_or(serde_json::Value::Null);
                        (column.clone(), value)
                    })
                    .collect()
            })
            .collect();

        Ok(LoadedRows {
            columns: projection,
            rows,
        })
    }

    /// Export path, derivable from the identifiers alone. The file exists
    /// once the result is published.
    pub fn export_location(&self, result_id: &str) -> PathBuf {
        self.result_dir(result_id).join(CSV_FILE)
    }

    /// Summaries of every published entry, oldest first.
    pub fn list_results(&self) -> Result<Vec<ResultSummary>> {
        let mut summaries = Vec::new();
        for entry in std::fs::read_dir(self.session_dir.join(RESULTS_DIR))? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            match std::fs::read(path.join(META_FILE))
                .map_err(StoreError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<ResultSummary>(&bytes)?))
            {
                Ok(summary) => summaries.push(summary),
                Err(err) => log::warn!("Skipping unreadable entry {}: {err}", path.display()),
            }
        }
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.result_id.cmp(&b.result_id))
        });
        Ok(summaries)
    }

    /// Remove one entry. Returns false when it was not present.
    pub fn delete_result(&self, result_id: &str) -> Result<bool> {
        validate_result_id(result_id)?;
        let published = self.result_dir(result_id);
        if !published.exists() {
            return Ok(false);
        }
        self.retire(&published, result_id)?;
        Ok(true)
    }

    /// Remove every entry older than `retention`. Published entries are
    /// immutable and staging entries invisible, so the sweep can interleave
    /// with concurrent `put`/`load` on unrelated entries.
    pub fn evict_expired(&self, retention: Duration) -> Result<usize> {
        self.evict_expired_at(retention, unix_now())
    }

    pub fn evict_expired_at(&self, retention: Duration, now: u64) -> Result<usize> {
        let mut evicted = 0;
        for entry in std::fs::read_dir(self.session_dir.join(RESULTS_DIR))? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let summary: ResultSummary = match std::fs::read(path.join(META_FILE))
                .map_err(StoreError::from)
                .and_then(|bytes| Ok(serde_json::from_slice(&bytes)?))
            {
                Ok(summary) => summary,
                Err(err) => {
                    // Unreadable metadata: leave the entry alone rather than
                    // guess at its age.
                    log::warn!("Sweep cannot read {}: {err}", path.display());
                    continue;
                }
            };
            if now.saturating_sub(summary.created_at) > retention.as_secs() {
                self.retire(&path, &summary.result_id)?;
                evicted += 1;
            }
        }

        self.sweep_staging(retention, now)?;

        if evicted > 0 {
            log::info!("Evicted {evicted} expired result(s)");
        }
        Ok(evicted)
    }

    /// Rename out of `results/` first so readers scanning the directory
    /// never observe a half-deleted entry, then delete for real.
    fn retire(&self, published: &Path, result_id: &str) -> Result<()> {
        let trash = self
            .session_dir
            .join(STAGING_DIR)
            .join(format!("{result_id}.retired.{}", nonce()));
        std::fs::rename(published, &trash)?;
        std::fs::remove_dir_all(&trash)?;
        Ok(())
    }

    /// Clear abandoned staging directories (crashed writes) once they are
    /// clearly dead.
    fn sweep_staging(&self, retention: Duration, now: u64) -> Result<()> {
        for entry in std::fs::read_dir(self.session_dir.join(STAGING_DIR))? {
            let entry = entry?;
            let age_secs = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|since_epoch| now.saturating_sub(since_epoch.as_secs()));
            if matches!(age_secs, Some(age) if age > retention.as_secs()) {
                log::debug!("Removing abandoned staging entry {:?}", entry.file_name());
                let _ = std::fs::remove_dir_all(entry.path());
            }
        }
        Ok(())
    }

    fn result_dir(&self, result_id: &str) -> PathBuf {
        self.session_dir.join(RESULTS_DIR).join(result_id)
    }
}

fn read_entry_file(path: &Path, result_id: &str) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(StoreError::UnknownSessionOrResult(result_id.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

/// Result ids are path components; restrict them to the hex alphabet the
/// deriver emits.
fn validate_result_id(result_id: &str) -> Result<()> {
    if result_id.is_empty() || !result_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(StoreError::UnknownSessionOrResult(result_id.to_string()));
    }
    Ok(())
}

fn nonce() -> String {
    let mut bytes = [0u8; 4];
    if getrandom::getrandom(&mut bytes).is_err() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.subsec_nanos());
        bytes = nanos.to_be_bytes();
    }
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

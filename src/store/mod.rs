//! Persisted multi-account token store
//!
//! One JSON document holds every API's access token:
//! `{status, data: {<api name>: record}, metadata}`. The document is only
//! ever rewritten whole, through `merge` and `cleanup`; unrelated entries
//! survive both. Loading never fails — a missing or corrupt file degrades
//! to the canonical empty document.
//!
//! A single invocation is assumed to own the file for the run's duration;
//! concurrent runs can race load→merge→persist.

pub mod validity;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use validity::{status_detail, TokenStatus};

/// Stamped into metadata.generated_by on every merge.
const GENERATED_BY: &str = "upstox-auth multi-account token manager";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Local naive ISO-8601, microsecond precision.
pub fn format_timestamp(t: NaiveDateTime) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Lenient ISO-8601 parse; fractional seconds optional.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access token store at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize token store document: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreStatus {
    Success,
    Error,
    Partial,
}

/// One API's stored token. Timestamps stay as strings and are parsed on
/// demand so a single malformed record never poisons the document; unknown
/// fields round-trip untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity_at: Option<String>,
    #[serde(default = "active_status")]
    pub status: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn active_status() -> String {
    "active".to_string()
}

impl TokenRecord {
    /// Build a freshly issued record. `validity_at` is always derived from
    /// `generated_at` through the validity policy, never set independently.
    pub fn issue(access_token: String, api_key: String, generated_at: NaiveDateTime) -> Self {
        let validity = validity::calculate_validity(generated_at);
        Self {
            access_token,
            api_key,
            generated_at: Some(format_timestamp(generated_at)),
            validity_at: Some(format_timestamp(validity)),
            status: active_status(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn generated_time(&self) -> Option<NaiveDateTime> {
        self.generated_at.as_deref().and_then(parse_timestamp)
    }

    pub fn validity_time(&self) -> Option<NaiveDateTime> {
        self.validity_at.as_deref().and_then(parse_timestamp)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_update: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_apis: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cleanup: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The whole persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenDocument {
    pub status: StoreStatus,
    #[serde(default)]
    pub data: HashMap<String, TokenRecord>,
    #[serde(default)]
    pub metadata: StoreMetadata,
}

impl Default for TokenDocument {
    fn default() -> Self {
        Self {
            status: StoreStatus::Success,
            data: HashMap::new(),
            metadata: StoreMetadata::default(),
        }
    }
}

/// Why cleanup removed an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Name no longer present in the configured credential set.
    Stale,
    /// `validity_at` has lapsed.
    Expired,
    /// No `validity_at`; `generated_at` older than 24 hours.
    LegacyExpired,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovalReason::Stale => write!(f, "removed from config"),
            RemovalReason::Expired => write!(f, "expired"),
            RemovalReason::LegacyExpired => write!(f, "legacy expiration"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemovedToken {
    pub name: String,
    pub reason: RemovalReason,
}

/// Per-document validity tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValiditySummary {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
    pub without_validity: usize,
}

impl ValiditySummary {
    pub fn describe(&self) -> String {
        format!(
            "{} token(s): {} valid, {} expired, {} without validity info",
            self.total, self.valid, self.expired, self.without_validity
        )
    }
}

/// Repository over the single token-table file.
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole document. A missing or unparsable file yields the
    /// canonical empty document; this never errors.
    pub fn load(&self) -> TokenDocument {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no token store at {}", self.path.display());
                return TokenDocument::default();
            }
            Err(e) => {
                tracing::warn!("token store unreadable ({}), starting empty: {}", self.path.display(), e);
                return TokenDocument::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!("token store corrupt ({}), starting empty: {}", self.path.display(), e);
                TokenDocument::default()
            }
        }
    }

    /// Rewrite the document atomically: temp file in the same directory,
    /// then rename over the target. A partially-written file is never
    /// observable by a subsequent `load`.
    fn persist(&self, doc: &TokenDocument) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;
            }
        }

        let content = serde_json::to_string_pretty(doc)?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, content).map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Upsert `records` into the document without disturbing unrelated
    /// entries, recompute metadata, force status=success, persist.
    pub fn merge(
        &self,
        records: &[(String, TokenRecord)],
        now: NaiveDateTime,
    ) -> Result<TokenDocument, StoreError> {
        let mut doc = self.load();

        let mut updated = Vec::with_capacity(records.len());
        for (name, record) in records {
            if doc.data.contains_key(name) {
                tracing::info!("replacing stored token for {}", name);
            } else {
                tracing::info!("storing new token for {}", name);
            }
            doc.data.insert(name.clone(), record.clone());
            updated.push(name.clone());
        }

        let previous = doc.metadata.clone();
        doc.metadata = StoreMetadata {
            last_updated: Some(format_timestamp(now)),
            total_tokens: Some(doc.data.len()),
            generated_by: Some(GENERATED_BY.to_string()),
            previous_update: Some(
                previous
                    .last_updated
                    .unwrap_or_else(|| "N/A".to_string()),
            ),
            updated_apis: Some(updated),
            last_cleanup: Some(
                previous
                    .last_cleanup
                    .unwrap_or_else(|| format_timestamp(now)),
            ),
            extra: previous.extra,
        };
        doc.status = StoreStatus::Success;

        self.persist(&doc)?;
        tracing::info!("token store written to {}", self.path.display());
        Ok(doc)
    }

    /// Drop entries that are no longer configured or whose validity has
    /// lapsed. Entries that cannot be dated are retained. Persists only if
    /// something was removed.
    pub fn cleanup(
        &self,
        current_names: &[&str],
        now: NaiveDateTime,
    ) -> Result<Vec<RemovedToken>, StoreError> {
        let mut doc = self.load();
        let mut removed = Vec::new();

        doc.data.retain(|name, record| {
            let reason = if !current_names.contains(&name.as_str()) {
                Some(RemovalReason::Stale)
            } else if record.validity_at.is_some() {
                (!validity::is_valid(record, now)).then_some(RemovalReason::Expired)
            } else {
                match record.generated_time() {
                    Some(generated) if now - generated > chrono::Duration::hours(24) => {
                        Some(RemovalReason::LegacyExpired)
                    }
                    _ => None,
                }
            };

            match reason {
                Some(reason) => {
                    removed.push(RemovedToken {
                        name: name.clone(),
                        reason,
                    });
                    false
                }
                None => true,
            }
        });

        if removed.is_empty() {
            return Ok(removed);
        }

        doc.metadata.last_cleanup = Some(format_timestamp(now));
        self.persist(&doc)?;

        for r in &removed {
            tracing::info!("cleaned up token {} ({})", r.name, r.reason);
        }
        Ok(removed)
    }

    /// Access token for one API, optionally gated on validity.
    pub fn get_token(&self, name: &str, check_validity: bool, now: NaiveDateTime) -> Option<String> {
        let doc = self.load();
        let record = doc.data.get(name)?;
        if check_validity && !validity::is_valid(record, now) {
            tracing::warn!("token for {} has expired", name);
            return None;
        }
        Some(record.access_token.clone())
    }

    /// All tokens with status "active", optionally gated on validity.
    pub fn all_active(&self, check_validity: bool, now: NaiveDateTime) -> HashMap<String, String> {
        let doc = self.load();
        let mut active = HashMap::new();
        for (name, record) in &doc.data {
            if record.status != "active" {
                continue;
            }
            if check_validity && !validity::is_valid(record, now) {
                tracing::warn!("token for {} has expired", name);
                continue;
            }
            active.insert(name.clone(), record.access_token.clone());
        }
        active
    }

    /// Records that are no longer valid.
    pub fn expired(&self, now: NaiveDateTime) -> HashMap<String, TokenRecord> {
        let doc = self.load();
        doc.data
            .into_iter()
            .filter(|(_, record)| !validity::is_valid(record, now))
            .collect()
    }

    /// Valid/expired/unknown tally across the document.
    pub fn summary(&self, now: NaiveDateTime) -> ValiditySummary {
        let doc = self.load();
        let mut summary = ValiditySummary {
            total: doc.data.len(),
            ..Default::default()
        };
        for record in doc.data.values() {
            if record.validity_at.is_none() {
                summary.without_validity += 1;
            } else if validity::is_valid(record, now) {
                summary.valid += 1;
            } else {
                summary.expired += 1;
            }
        }
        summary
    }
}

/// Print the per-token validity report for the `status` command.
pub fn print_validity_report(store: &TokenStore, now: NaiveDateTime) {
    let doc = store.load();
    if doc.data.is_empty() {
        println!("No tokens stored at {}.", store.path().display());
        println!("Run 'upstox-auth login' to generate tokens.");
        return;
    }

    let mut names: Vec<&String> = doc.data.keys().collect();
    names.sort();

    for name in names {
        let record = &doc.data[name.as_str()];
        println!();
        println!("{}", name);
        match status_detail(record, now) {
            TokenStatus::Valid {
                expires_at,
                remaining,
            } => {
                println!("  status:      valid");
                println!("  expires at:  {}", expires_at.format("%Y-%m-%d %H:%M:%S"));
                println!(
                    "  time left:   {} ({} h)",
                    validity::human_duration(remaining),
                    validity::hours(remaining)
                );
            }
            TokenStatus::Expired { expired_at, since } => {
                println!("  status:      expired");
                println!("  expired at:  {}", expired_at.format("%Y-%m-%d %H:%M:%S"));
                println!(
                    "  expired ago: {} ({} h)",
                    validity::human_duration(since),
                    validity::hours(since)
                );
            }
            TokenStatus::Unknown { reason } => {
                println!("  status:      unknown ({})", reason);
            }
        }
        if let Some(generated) = record.generated_time() {
            println!("  generated:   {}", generated.format("%Y-%m-%d %H:%M:%S"));
        }
    }

    println!();
    println!("Summary: {}", store.summary(now).describe());
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    fn store_in(dir: &tempfile::TempDir) -> TokenStore {
        TokenStore::new(dir.path().join("tokens.json"))
    }

    fn record_at(generated: NaiveDateTime) -> TokenRecord {
        TokenRecord::issue("tok".into(), "key".into(), generated)
    }

    #[test]
    fn test_load_missing_file_is_empty_success() {
        let dir = tempfile::tempdir().unwrap();
        let doc = store_in(&dir).load();
        assert_eq!(doc.status, StoreStatus::Success);
        assert!(doc.data.is_empty());
        assert_eq!(doc.metadata, StoreMetadata::default());
    }

    #[test]
    fn test_load_corrupt_file_is_empty_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "{not json").unwrap();
        let doc = store.load();
        assert_eq!(doc.status, StoreStatus::Success);
        assert!(doc.data.is_empty());
    }

    #[test]
    fn test_merge_upserts_without_disturbing_others() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let now = ts("2024-05-01T10:00:00");

        // Pre-existing unrelated entry with an unknown extra field.
        let mut c = record_at(ts("2024-05-01T09:00:00"));
        c.extra
            .insert("note".into(), serde_json::Value::String("keep me".into()));
        store.merge(&[("C".into(), c.clone())], now).unwrap();

        let a1 = record_at(now);
        store.merge(&[("A".into(), a1.clone())], now).unwrap();
        let b = record_at(now);
        store.merge(&[("B".into(), b.clone())], now).unwrap();

        let doc = store.load();
        assert_eq!(doc.data.len(), 3);
        assert_eq!(doc.data["A"], a1);
        assert_eq!(doc.data["B"], b);
        assert_eq!(doc.data["C"], c);

        // Re-merging A replaces only A.
        let a2 = TokenRecord::issue("tok2".into(), "key".into(), now);
        let doc = store.merge(&[("A".into(), a2.clone())], now).unwrap();
        assert_eq!(doc.data["A"], a2);
        assert_eq!(doc.data["B"], b);
        assert_eq!(doc.data["C"], c);
        assert_eq!(doc.metadata.total_tokens, Some(3));
        assert_eq!(doc.metadata.updated_apis, Some(vec!["A".to_string()]));
    }

    #[test]
    fn test_merge_metadata_chain() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let t1 = ts("2024-05-01T10:00:00");
        let doc = store.merge(&[("A".into(), record_at(t1))], t1).unwrap();
        assert_eq!(doc.metadata.previous_update.as_deref(), Some("N/A"));
        assert_eq!(doc.metadata.last_updated, Some(format_timestamp(t1)));
        assert_eq!(doc.metadata.generated_by.as_deref(), Some(GENERATED_BY));

        let t2 = ts("2024-05-01T11:00:00");
        let doc = store.merge(&[("B".into(), record_at(t2))], t2).unwrap();
        assert_eq!(
            doc.metadata.previous_update,
            Some(format_timestamp(t1))
        );
        assert_eq!(doc.metadata.last_updated, Some(format_timestamp(t2)));
        assert_eq!(doc.metadata.total_tokens, Some(2));
    }

    #[test]
    fn test_cleanup_removes_exactly_the_lapsed_and_stale() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let now = ts("2024-05-03T10:00:00");

        let fresh = record_at(ts("2024-05-03T09:00:00"));
        let expired = record_at(ts("2024-05-01T10:00:00"));
        let stale = record_at(ts("2024-05-03T09:00:00"));
        let legacy_old = TokenRecord {
            validity_at: None,
            ..record_at(ts("2024-05-01T10:00:00"))
        };
        let legacy_fresh = TokenRecord {
            validity_at: None,
            ..record_at(ts("2024-05-03T09:00:00"))
        };
        let undated = TokenRecord {
            generated_at: Some("garbage".into()),
            validity_at: None,
            ..record_at(now)
        };

        store
            .merge(
                &[
                    ("FRESH".into(), fresh.clone()),
                    ("EXPIRED".into(), expired),
                    ("STALE".into(), stale),
                    ("LEGACY_OLD".into(), legacy_old),
                    ("LEGACY_FRESH".into(), legacy_fresh.clone()),
                    ("UNDATED".into(), undated.clone()),
                ],
                now,
            )
            .unwrap();

        let names = ["FRESH", "EXPIRED", "LEGACY_OLD", "LEGACY_FRESH", "UNDATED"];
        let removed = store.cleanup(&names, now).unwrap();

        let mut removed_names: Vec<&str> = removed.iter().map(|r| r.name.as_str()).collect();
        removed_names.sort();
        assert_eq!(removed_names, vec!["EXPIRED", "LEGACY_OLD", "STALE"]);
        for r in &removed {
            let expect = match r.name.as_str() {
                "EXPIRED" => RemovalReason::Expired,
                "LEGACY_OLD" => RemovalReason::LegacyExpired,
                "STALE" => RemovalReason::Stale,
                other => panic!("unexpected removal {}", other),
            };
            assert_eq!(r.reason, expect);
        }

        let doc = store.load();
        assert_eq!(doc.data.len(), 3);
        // Survivors are untouched.
        assert_eq!(doc.data["FRESH"], fresh);
        assert_eq!(doc.data["LEGACY_FRESH"], legacy_fresh);
        assert_eq!(doc.data["UNDATED"], undated);
        assert_eq!(doc.metadata.last_cleanup, Some(format_timestamp(now)));
    }

    #[test]
    fn test_cleanup_without_removals_does_not_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let removed = store
            .cleanup(&["A"], ts("2024-05-01T10:00:00"))
            .unwrap();
        assert!(removed.is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_persist_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let now = ts("2024-05-01T10:00:00");
        store.merge(&[("A".into(), record_at(now))], now).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("tokens.json")]);
    }

    #[test]
    fn test_queries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let now = ts("2024-05-03T10:00:00");

        let fresh = record_at(ts("2024-05-03T09:00:00"));
        let expired = record_at(ts("2024-05-01T10:00:00"));
        let inactive = TokenRecord {
            status: "revoked".into(),
            ..record_at(ts("2024-05-03T09:00:00"))
        };
        let unknown = TokenRecord {
            validity_at: None,
            generated_at: None,
            ..record_at(now)
        };
        store
            .merge(
                &[
                    ("FRESH".into(), fresh),
                    ("EXPIRED".into(), expired),
                    ("INACTIVE".into(), inactive),
                    ("UNKNOWN".into(), unknown),
                ],
                now,
            )
            .unwrap();

        assert_eq!(store.get_token("FRESH", true, now).as_deref(), Some("tok"));
        assert_eq!(store.get_token("EXPIRED", true, now), None);
        assert_eq!(
            store.get_token("EXPIRED", false, now).as_deref(),
            Some("tok")
        );
        assert_eq!(store.get_token("MISSING", false, now), None);

        let active = store.all_active(true, now);
        assert_eq!(active.len(), 1);
        assert!(active.contains_key("FRESH"));
        let active_unchecked = store.all_active(false, now);
        assert_eq!(active_unchecked.len(), 3);
        assert!(!active_unchecked.contains_key("INACTIVE"));

        let expired_map = store.expired(now);
        let mut expired_names: Vec<&str> = expired_map.keys().map(String::as_str).collect();
        expired_names.sort();
        assert_eq!(expired_names, vec!["EXPIRED", "UNKNOWN"]);

        let summary = store.summary(now);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.valid, 2); // FRESH + INACTIVE still inside validity
        assert_eq!(summary.expired, 1);
        assert_eq!(summary.without_validity, 1);
        assert_eq!(
            summary.describe(),
            "4 token(s): 2 valid, 1 expired, 1 without validity info"
        );
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let t = ts("2024-05-01T10:00:00") + Duration::microseconds(123456);
        assert_eq!(parse_timestamp(&format_timestamp(t)), Some(t));
        // Python-style isoformat without fraction parses too.
        assert_eq!(
            parse_timestamp("2024-05-01T10:00:00"),
            Some(ts("2024-05-01T10:00:00"))
        );
        assert_eq!(parse_timestamp("not a date"), None);
    }
}

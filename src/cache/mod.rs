//! Decision cache
//!
//! Persists optimization decisions keyed by workload fingerprint so a
//! repeated workload skips the candidate search. Entries are single JSON
//! files under the cache root; every write goes to a `.tmp` sibling and is
//! atomically renamed into place, which is the only cross-process
//! synchronisation. Readers never raise: a missing, partial, or corrupt
//! file is a miss, and corrupt files are quarantined with a `.bad` suffix
//! so they stop masquerading as valid.
//!
//! Misses report the actual state at the moment of decision: all checks run
//! on the bytes already read before any opportunistic pruning, so a
//! concurrent prune cannot turn a truthful "expired" into a misleading
//! "no entry".

use crate::planner::OptimizationPlan;
use crate::probe::SystemSignature;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Bumped on incompatible changes to the entry schema
pub const PLAN_VERSION: u32 = 1;

/// Probability that a miss also triggers a prune pass
const PRUNE_PROBABILITY: f64 = 0.05;

const ENTRY_SUFFIX: &str = ".entry";
const TMP_SUFFIX: &str = ".entry.tmp";
const BAD_SUFFIX: &str = ".entry.bad";

/// One persisted decision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub plan_version: u32,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub system_signature: SystemSignature,
    pub plan: OptimizationPlan,
}

impl CacheEntry {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.created_at + Duration::seconds(self.ttl_seconds as i64)
    }
}

/// Why a lookup came back empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    NoEntry,
    Corrupt,
    VersionMismatch,
    Expired,
    SystemChanged,
}

impl MissReason {
    pub fn code(&self) -> &'static str {
        match self {
            MissReason::NoEntry => "no_entry",
            MissReason::Corrupt => "corrupt",
            MissReason::VersionMismatch => "version_mismatch",
            MissReason::Expired => "expired",
            MissReason::SystemChanged => "system_changed",
        }
    }
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Aggregate view for `cache stats`
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub expired: usize,
    pub quarantined: usize,
    pub oldest_age_seconds: Option<i64>,
    pub newest_age_seconds: Option<i64>,
}

/// Filesystem-backed decision cache
#[derive(Debug, Clone)]
pub struct DecisionCache {
    dir: PathBuf,
    disabled: bool,
}

impl DecisionCache {
    /// Open the per-user cache, honoring `AMORSIZE_HOME` and
    /// `AMORSIZE_NO_CACHE`
    pub fn open(no_cache: bool) -> Self {
        let disabled = no_cache
            || std::env::var("AMORSIZE_NO_CACHE").map(|v| v == "1").unwrap_or(false);
        Self {
            dir: default_root().join("cache"),
            disabled,
        }
    }

    /// Open a cache at an explicit directory (tests, CLI admin)
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            disabled: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Look up a fingerprint, validating version, TTL, and system match
    pub fn lookup(&self, fingerprint: &str, signature: &SystemSignature) -> Option<CacheEntry> {
        if self.disabled {
            return None;
        }
        match self.lookup_at(fingerprint, signature, Utc::now()) {
            Ok(entry) => {
                tracing::info!(fingerprint, "cache_hit");
                Some(entry)
            }
            Err(reason) => {
                tracing::info!(fingerprint, reason = reason.code(), "cache_miss");
                None
            }
        }
    }

    /// The lookup protocol with an injected clock
    ///
    /// The decision is made entirely from the bytes read up front; pruning
    /// runs only after the reason is fixed.
    pub fn lookup_at(
        &self,
        fingerprint: &str,
        signature: &SystemSignature,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, MissReason> {
        let path = self.entry_path(fingerprint);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(_) => {
                self.maybe_prune(now);
                return Err(MissReason::NoEntry);
            }
        };

        let entry: CacheEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(_) => {
                self.quarantine(&path, fingerprint);
                self.maybe_prune(now);
                return Err(MissReason::Corrupt);
            }
        };

        if entry.plan_version != PLAN_VERSION {
            return Err(MissReason::VersionMismatch);
        }
        if entry.expired(now) {
            self.maybe_prune(now);
            return Err(MissReason::Expired);
        }
        if &entry.system_signature != signature {
            return Err(MissReason::SystemChanged);
        }
        Ok(entry)
    }

    /// Persist a decision under its fingerprint
    ///
    /// Failures are logged and swallowed; the cache is an accelerator,
    /// never a correctness dependency.
    pub fn store(
        &self,
        fingerprint: &str,
        plan: &OptimizationPlan,
        ttl_seconds: u64,
        signature: &SystemSignature,
    ) {
        if self.disabled {
            return;
        }
        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            plan_version: PLAN_VERSION,
            created_at: Utc::now(),
            ttl_seconds,
            system_signature: signature.clone(),
            plan: OptimizationPlan {
                from_cache: false,
                ..plan.clone()
            },
        };
        if let Err(error) = self.write_entry(&entry) {
            tracing::warn!(fingerprint, %error, "cache store failed");
        }
    }

    fn write_entry(&self, entry: &CacheEntry) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!("{}{}", entry.fingerprint, TMP_SUFFIX));
        let target = self.entry_path(&entry.fingerprint);
        let json = serde_json::to_vec_pretty(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &target)
    }

    /// Remove expired, version-mismatched, and system-incompatible entries
    ///
    /// Unparsable files are quarantined instead of deleted so their content
    /// stays available for inspection. Returns the number of files acted on.
    pub fn prune(&self, signature: &SystemSignature) -> usize {
        self.prune_at(signature, Utc::now())
    }

    pub fn prune_at(&self, signature: &SystemSignature, now: DateTime<Utc>) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let mut removed = 0;
        for dir_entry in entries.flatten() {
            let path = dir_entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if name.ends_with(TMP_SUFFIX) {
                // Leftover from an interrupted writer
                if fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
                continue;
            }
            if !name.ends_with(ENTRY_SUFFIX) {
                continue;
            }
            let stale = match fs::read(&path)
                .ok()
                .and_then(|raw| serde_json::from_slice::<CacheEntry>(&raw).ok())
            {
                Some(entry) => {
                    entry.plan_version != PLAN_VERSION
                        || entry.expired(now)
                        || &entry.system_signature != signature
                }
                None => {
                    let fingerprint = name.trim_end_matches(ENTRY_SUFFIX).to_string();
                    self.quarantine(&path, &fingerprint);
                    removed += 1;
                    continue;
                }
            };
            if stale && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Delete every entry and quarantined file
    pub fn clear(&self) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let mut removed = 0;
        for dir_entry in entries.flatten() {
            let path = dir_entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if name.ends_with(ENTRY_SUFFIX)
                || name.ends_with(BAD_SUFFIX)
                || name.ends_with(TMP_SUFFIX)
            {
                if fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Counts and age distribution for diagnostics
    pub fn stats(&self) -> CacheStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> CacheStats {
        let mut stats = CacheStats::default();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return stats,
        };
        for dir_entry in entries.flatten() {
            let path = dir_entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if name.ends_with(BAD_SUFFIX) {
                stats.quarantined += 1;
                continue;
            }
            if !name.ends_with(ENTRY_SUFFIX) {
                continue;
            }
            if let Some(entry) = fs::read(&path)
                .ok()
                .and_then(|raw| serde_json::from_slice::<CacheEntry>(&raw).ok())
            {
                stats.entries += 1;
                if entry.expired(now) {
                    stats.expired += 1;
                }
                let age = (now - entry.created_at).num_seconds();
                stats.oldest_age_seconds =
                    Some(stats.oldest_age_seconds.map_or(age, |oldest| oldest.max(age)));
                stats.newest_age_seconds =
                    Some(stats.newest_age_seconds.map_or(age, |newest| newest.min(age)));
            }
        }
        stats
    }

    /// List fingerprints with entries on disk, sorted
    pub fn list(&self) -> Vec<String> {
        let mut fingerprints = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for dir_entry in entries.flatten() {
                if let Some(name) = dir_entry.path().file_name().and_then(|n| n.to_str()) {
                    if let Some(fingerprint) = name.strip_suffix(ENTRY_SUFFIX) {
                        fingerprints.push(fingerprint.to_string());
                    }
                }
            }
        }
        fingerprints.sort();
        fingerprints
    }

    /// Read one entry without validation (CLI `cache show`)
    pub fn show(&self, fingerprint: &str) -> Option<CacheEntry> {
        let raw = fs::read(self.entry_path(fingerprint)).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{}{}", fingerprint, ENTRY_SUFFIX))
    }

    fn quarantine(&self, path: &Path, fingerprint: &str) {
        let bad = self.dir.join(format!("{}{}", fingerprint, BAD_SUFFIX));
        if let Err(error) = fs::rename(path, &bad) {
            tracing::warn!(fingerprint, %error, "failed to quarantine corrupt cache entry");
        }
    }

    fn maybe_prune(&self, now: DateTime<Utc>) {
        if rand::thread_rng().gen::<f64>() < PRUNE_PROBABILITY {
            // Pruning validates against the current system, so reuse the
            // stored signatures only for expiry; incompatible entries are
            // caught on their own lookups.
            let signature = crate::probe::info().signature();
            let removed = self.prune_at(&signature, now);
            if removed > 0 {
                tracing::debug!(removed, "opportunistic cache prune");
            }
        }
    }
}

/// State root: `$AMORSIZE_HOME`, else `~/.amorsize`
pub fn default_root() -> PathBuf {
    if let Ok(home) = std::env::var("AMORSIZE_HOME") {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(".amorsize");
        }
    }
    std::env::temp_dir().join(".amorsize")
}

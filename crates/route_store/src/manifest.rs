//! Per-entry manifest describing which page sets exist and what they cover.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::order::SortKey;
use crate::tokens::InvariantTokens;

/// Manifest file name inside an entry directory.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Current on-disk manifest layout version.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// One page file of a page set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    /// File name relative to the entry's `pages/` directory.
    pub file: String,
    /// Rows stored in the page.
    pub rows: usize,
    /// CRC32 of the page file bytes.
    pub crc32: u32,
}

/// Ordered, gapless run of pages produced by one materialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSet {
    /// Unique id of the materialization that wrote the pages.
    pub set_id: String,
    /// Invariant box the rows cover (unconstrained for a superset).
    pub tokens: InvariantTokens,
    pub pages: Vec<PageRef>,
    pub total_rows: usize,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

impl PageSet {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Page files in sequence order.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.pages.iter().map(|page| page.file.as_str())
    }
}

/// Explicit coverage state of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Coverage {
    /// One page set holding every invariant value.
    Superset { pages: PageSet },
    /// Independently materialized shards, each tagged with its box.
    Shards { shards: Vec<PageSet> },
}

impl Coverage {
    /// Every page set, live or not.
    pub fn sets(&self) -> Vec<&PageSet> {
        match self {
            Self::Superset { pages } => vec![pages],
            Self::Shards { shards } => shards.iter().collect(),
        }
    }

    /// Page sets that have not expired at `now_ms`.
    pub fn live_sets(&self, now_ms: u64) -> Vec<&PageSet> {
        self.sets()
            .into_iter()
            .filter(|set| !set.is_expired(now_ms))
            .collect()
    }

    pub fn is_superset(&self) -> bool {
        matches!(self, Self::Superset { .. })
    }
}

/// Manifest (cache entry metadata) for one base key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub format_version: u32,
    pub route_id: String,
    pub base_key: String,
    pub schema_fingerprint: String,
    pub order_by: Vec<SortKey>,
    pub coverage: Coverage,
    pub updated_at_ms: u64,
}

impl CacheManifest {
    /// Rows across all live page sets.
    pub fn total_rows(&self, now_ms: u64) -> usize {
        self.coverage
            .live_sets(now_ms)
            .iter()
            .map(|set| set.total_rows)
            .sum()
    }

    /// Latest expiry across page sets; the entry is dead after this instant.
    pub fn expires_at_ms(&self) -> u64 {
        self.coverage
            .sets()
            .iter()
            .map(|set| set.expires_at_ms)
            .max()
            .unwrap_or(0)
    }

    /// Invariant token to page files index; a superset is indexed under `*`.
    pub fn page_index(&self) -> BTreeMap<String, Vec<String>> {
        let mut index: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for set in self.coverage.sets() {
            let tokens = if set.tokens.is_unconstrained() {
                vec!["*".to_string()]
            } else {
                set.tokens.flatten().into_iter().collect()
            };
            for token in tokens {
                index
                    .entry(token)
                    .or_default()
                    .extend(set.files().map(str::to_string));
            }
        }
        index
    }
}

/// What was found at an entry's manifest path.
#[derive(Debug)]
pub enum ManifestState {
    Absent,
    Corrupt(String),
    Present(CacheManifest),
}

/// Loads the manifest of an entry directory.
pub fn read_manifest(entry_dir: &Path) -> StoreResult<ManifestState> {
    let path = entry_dir.join(MANIFEST_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ManifestState::Absent);
        }
        Err(err) => {
            return Err(StoreError::io(format!("read {}", path.display()), err));
        }
    };
    match serde_json::from_slice::<CacheManifest>(&bytes) {
        Ok(manifest) if manifest.format_version == MANIFEST_FORMAT_VERSION => {
            Ok(ManifestState::Present(manifest))
        }
        Ok(manifest) => Ok(ManifestState::Corrupt(format!(
            "unsupported manifest format version {}",
            manifest.format_version
        ))),
        Err(err) => Ok(ManifestState::Corrupt(format!("decode manifest: {err}"))),
    }
}

/// Atomically replaces the manifest of an entry directory.
pub fn write_manifest(entry_dir: &Path, manifest: &CacheManifest, writer_id: &str) -> StoreResult<()> {
    let path = entry_dir.join(MANIFEST_FILE);
    let tmp_path = entry_dir.join(format!("{MANIFEST_FILE}.{writer_id}.tmp"));
    let payload = serde_json::to_vec_pretty(manifest)?;
    let mut out = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp_path)
        .map_err(|err| StoreError::io(format!("open {}", tmp_path.display()), err))?;
    out.write_all(&payload)
        .map_err(|err| StoreError::io("write manifest", err))?;
    out.sync_all()
        .map_err(|err| StoreError::io("sync manifest", err))?;
    fs::rename(&tmp_path, &path).map_err(|err| StoreError::io("replace manifest", err))?;
    Ok(())
}

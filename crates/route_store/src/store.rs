//! Paged cache store: lookup, materialization and invalidation of cache entries.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<route-dir>/<base_key>/manifest.json
//! <root>/<route-dir>/<base_key>/pages/<set-id>-<seq>.arrow
//! <root>/<route-dir>/.staging-<base_key>-<set-id>/...
//! <root>/<route-dir>/<base_key>.lock
//! ```
//!
//! Every operation here is blocking filesystem I/O; async callers are
//! expected to run it on a blocking thread.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::lock::ManifestLock;
use crate::manifest::{
    read_manifest, write_manifest, CacheManifest, Coverage, ManifestState, PageRef, PageSet,
    MANIFEST_FORMAT_VERSION,
};
use crate::order::{check_sorted, concat, slice, sort_batch, RowWindow, SortKey};
use crate::page::{
    paginate, read_page, read_page_schema, schema_fingerprint, write_page, PageReadError,
    PAGE_EXTENSION,
};
use crate::shard::{check_within_box, filter_to_box, filter_to_cells};
use crate::tokens::{plan_coverage, CoverageDecision, CoveragePlan, InvariantColumn, InvariantTokens};

/// Directory holding committed page files inside an entry.
const PAGES_DIR: &str = "pages";
/// Prefix of per-materialization staging directories, kept beside entries in the route dir.
const STAGING_PREFIX: &str = ".staging-";
/// Prefix of retired entry directories awaiting removal.
const TRASH_PREFIX: &str = ".trash-";
/// Lock wait used by lazy invalidation; contention just skips the cleanup.
const INVALIDATION_LOCK_WAIT: Duration = Duration::from_millis(50);

/// Store-wide settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory of the cache tree.
    pub root: PathBuf,
    /// Maximum wait for an entry's manifest lock before yielding to the holder.
    pub lock_timeout: Duration,
    /// Age after which a lock file is treated as abandoned.
    pub stale_lock_after: Duration,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: Duration::from_secs(2),
            stale_lock_after: Duration::from_secs(30),
        }
    }
}

/// Identity of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub route_id: String,
    pub base_key: String,
}

impl EntryKey {
    pub fn new(route_id: impl Into<String>, base_key: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            base_key: base_key.into(),
        }
    }
}

/// Cooperative cancellation shared between a request and its blocking store work.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Parameters of a cache probe.
#[derive(Debug, Clone)]
pub struct LookupRequest {
    pub key: EntryKey,
    pub tokens: InvariantTokens,
    pub invariant_columns: Vec<InvariantColumn>,
    pub order_by: Vec<SortKey>,
    /// Rows to return; `total_rows` is reported for the unwindowed result.
    pub window: Option<RowWindow>,
}

/// How a hit was assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    /// A page set whose box equals the request.
    Exact,
    /// Rows filtered out of a superset page set.
    Superset,
    /// Several shards filtered, concatenated and re-sorted.
    Combined { shards: usize },
}

/// Rows served from the cache.
#[derive(Debug, Clone)]
pub struct CachedRows {
    pub schema: SchemaRef,
    pub rows: RecordBatch,
    pub total_rows: usize,
    pub source: HitSource,
}

/// Why a probe was not answered from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    Absent,
    Expired,
    Corrupt,
    SchemaMismatch,
    OrderMismatch,
    Uncovered,
    TooManyCells,
    /// Pages vanished mid-read because a concurrent writer replaced them.
    Superseded,
}

impl MissReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Expired => "expired",
            Self::Corrupt => "corrupt",
            Self::SchemaMismatch => "schema_mismatch",
            Self::OrderMismatch => "order_mismatch",
            Self::Uncovered => "uncovered",
            Self::TooManyCells => "too_many_cells",
            Self::Superseded => "superseded",
        }
    }
}

/// Result of a cache probe.
#[derive(Debug, Clone)]
pub enum CacheRead {
    Hit(CachedRows),
    Miss(MissReason),
}

/// Rows to persist for one key and invariant box.
#[derive(Debug, Clone)]
pub struct MaterializeRequest {
    pub key: EntryKey,
    pub tokens: InvariantTokens,
    pub invariant_columns: Vec<InvariantColumn>,
    pub order_by: Vec<SortKey>,
    pub rows_per_page: usize,
    pub ttl: Duration,
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

/// What a materialization did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializeOutcome {
    pub set_id: String,
    pub pages: usize,
    pub rows: usize,
    /// `false` when another writer held the entry and this output was discarded.
    pub committed: bool,
    /// Page sets removed because the new set superseded them.
    pub replaced_sets: usize,
}

/// Exact page files backing one box, for scanning as a table.
#[derive(Debug, Clone)]
pub struct PageSetHandle {
    pub schema: SchemaRef,
    pub pages: Vec<(PathBuf, u32)>,
    pub total_rows: usize,
}

/// On-disk paged result cache.
#[derive(Debug, Clone)]
pub struct PagedCacheStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    next_set: AtomicU64,
}

impl PagedCacheStore {
    pub fn new(config: StoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                clock,
                next_set: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    fn now_ms(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    fn route_dir(&self, route_id: &str) -> PathBuf {
        self.inner.config.root.join(route_dir_name(route_id))
    }

    fn entry_dir(&self, key: &EntryKey) -> PathBuf {
        self.route_dir(&key.route_id).join(&key.base_key)
    }

    fn lock_path(&self, key: &EntryKey) -> PathBuf {
        self.route_dir(&key.route_id)
            .join(format!("{}.lock", key.base_key))
    }

    fn next_set_id(&self) -> String {
        let seq = self.inner.next_set.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or(0);
        format!("{nanos:x}-{:x}-{seq:x}", std::process::id())
    }

    /// Probes the cache for rows covering `request.tokens`.
    ///
    /// Anything that casts doubt on completeness (expiry, corruption,
    /// schema or ordering drift, partial coverage) is a miss.
    pub fn lookup(&self, request: &LookupRequest) -> StoreResult<CacheRead> {
        let entry_dir = self.entry_dir(&request.key);
        let manifest = match read_manifest(&entry_dir)? {
            ManifestState::Absent => return Ok(CacheRead::Miss(MissReason::Absent)),
            ManifestState::Corrupt(reason) => {
                warn!(
                    route_id = %request.key.route_id,
                    base_key = %request.key.base_key,
                    reason = %reason,
                    "cache manifest unreadable; invalidating"
                );
                self.invalidate_if_unchanged(&request.key, None);
                return Ok(CacheRead::Miss(MissReason::Corrupt));
            }
            ManifestState::Present(manifest) => manifest,
        };

        if manifest.order_by != request.order_by {
            self.invalidate_if_unchanged(&request.key, Some(manifest.updated_at_ms));
            return Ok(CacheRead::Miss(MissReason::OrderMismatch));
        }

        let now = self.now_ms();
        let live = manifest.coverage.live_sets(now);
        if live.is_empty() {
            debug!(
                route_id = %request.key.route_id,
                base_key = %request.key.base_key,
                "cache entry expired; invalidating"
            );
            self.invalidate_if_unchanged(&request.key, Some(manifest.updated_at_ms));
            return Ok(CacheRead::Miss(MissReason::Expired));
        }

        let boxes = live.iter().map(|set| &set.tokens).collect::<Vec<_>>();
        let plan = match plan_coverage(&request.tokens, &boxes) {
            CoverageDecision::Covered(plan) => plan,
            CoverageDecision::Uncovered => return Ok(CacheRead::Miss(MissReason::Uncovered)),
            CoverageDecision::TooManyCells => {
                return Ok(CacheRead::Miss(MissReason::TooManyCells));
            }
        };

        let read = match plan {
            CoveragePlan::Exact(idx) => {
                self.read_exact(&entry_dir, &manifest, live[idx], request.window)
            }
            CoveragePlan::Superset(idx) => {
                self.read_superset(&entry_dir, &manifest, live[idx], request)
            }
            CoveragePlan::Assigned(assignments) => {
                self.read_assigned(&entry_dir, &manifest, &live, &assignments, request)
            }
        };

        match read {
            Ok(rows) => Ok(CacheRead::Hit(rows)),
            Err(PageReadError::Missing) => Ok(CacheRead::Miss(MissReason::Superseded)),
            Err(PageReadError::Corrupt(reason)) => {
                let schema_drift = reason.starts_with(SCHEMA_DRIFT);
                warn!(
                    route_id = %request.key.route_id,
                    base_key = %request.key.base_key,
                    reason = %reason,
                    "cache pages failed verification; invalidating"
                );
                self.invalidate_if_unchanged(&request.key, Some(manifest.updated_at_ms));
                Ok(CacheRead::Miss(if schema_drift {
                    MissReason::SchemaMismatch
                } else {
                    MissReason::Corrupt
                }))
            }
            Err(PageReadError::Store(err)) => Err(err),
        }
    }

    fn read_set_page(
        &self,
        entry_dir: &Path,
        manifest: &CacheManifest,
        page: &PageRef,
    ) -> Result<RecordBatch, PageReadError> {
        let path = entry_dir.join(PAGES_DIR).join(&page.file);
        let batch = read_page(&path, page.crc32, None)?;
        if schema_fingerprint(batch.schema().as_ref()) != manifest.schema_fingerprint {
            return Err(PageReadError::Corrupt(format!(
                "{SCHEMA_DRIFT}: page {} does not match manifest schema",
                page.file
            )));
        }
        Ok(batch)
    }

    /// Serves an exact box, reading only the pages overlapping the window.
    fn read_exact(
        &self,
        entry_dir: &Path,
        manifest: &CacheManifest,
        set: &PageSet,
        window: Option<RowWindow>,
    ) -> Result<CachedRows, PageReadError> {
        let total = set.total_rows;
        let (offset, length) = window.unwrap_or_default().bounds(total);

        let mut batches = Vec::new();
        let mut page_start = 0usize;
        let mut first_page_offset = None;
        for page in &set.pages {
            let page_end = page_start + page.rows;
            let overlaps = page_end > offset && page_start < offset + length;
            if overlaps {
                first_page_offset.get_or_insert(page_start);
                batches.push(self.read_set_page(entry_dir, manifest, page)?);
            }
            page_start = page_end;
        }
        if batches.is_empty() {
            // Nothing in range; read the first page for its schema.
            let first = set
                .pages
                .first()
                .ok_or_else(|| PageReadError::Corrupt(format!("page set {} has no pages", set.set_id)))?;
            let batch = self.read_set_page(entry_dir, manifest, first)?;
            let schema = batch.schema();
            return Ok(CachedRows {
                rows: RecordBatch::new_empty(Arc::clone(&schema)),
                schema,
                total_rows: total,
                source: HitSource::Exact,
            });
        }

        let schema = batches[0].schema();
        let combined = concat(&schema, &batches)?;
        let local_offset = offset - first_page_offset.unwrap_or(0);
        let rows = combined.slice(local_offset, length.min(combined.num_rows() - local_offset));
        Ok(CachedRows {
            schema,
            rows,
            total_rows: total,
            source: HitSource::Exact,
        })
    }

    /// Serves a request from a superset, filtering every page to the request box.
    fn read_superset(
        &self,
        entry_dir: &Path,
        manifest: &CacheManifest,
        set: &PageSet,
        request: &LookupRequest,
    ) -> Result<CachedRows, PageReadError> {
        let mut schema: Option<SchemaRef> = None;
        let mut parts = Vec::with_capacity(set.pages.len());
        for page in &set.pages {
            let batch = self.read_set_page(entry_dir, manifest, page)?;
            schema.get_or_insert_with(|| batch.schema());
            parts.push(filter_to_box(&batch, &request.tokens, &request.invariant_columns)?);
        }
        let schema = schema
            .ok_or_else(|| PageReadError::Corrupt(format!("page set {} has no pages", set.set_id)))?;
        let combined = concat(&schema, &parts)?;
        Ok(CachedRows {
            schema,
            total_rows: combined.num_rows(),
            rows: slice(&combined, request.window),
            source: HitSource::Superset,
        })
    }

    /// Serves a request from filtered shard pages.
    fn read_assigned(
        &self,
        entry_dir: &Path,
        manifest: &CacheManifest,
        live: &[&PageSet],
        assignments: &[(usize, BTreeSet<Vec<String>>)],
        request: &LookupRequest,
    ) -> Result<CachedRows, PageReadError> {
        let mut schema: Option<SchemaRef> = None;
        let mut parts = Vec::new();
        for (idx, cells) in assignments {
            let set = live[*idx];
            for page in &set.pages {
                let batch = self.read_set_page(entry_dir, manifest, page)?;
                schema.get_or_insert_with(|| batch.schema());
                parts.push(filter_to_cells(
                    &batch,
                    &request.tokens,
                    &request.invariant_columns,
                    cells,
                )?);
            }
        }
        let schema = schema
            .ok_or_else(|| PageReadError::Corrupt("covering page sets have no pages".to_string()))?;
        let combined = concat(&schema, &parts)?;
        // Shards are each ordered, their interleaving is not.
        let sorted = if assignments.len() > 1 {
            sort_batch(&combined, &request.order_by)?
        } else {
            combined
        };
        Ok(CachedRows {
            schema,
            total_rows: sorted.num_rows(),
            rows: slice(&sorted, request.window),
            source: HitSource::Combined {
                shards: assignments.len(),
            },
        })
    }

    /// Persists `request.batches` as a new page set and commits it to the manifest.
    pub fn materialize(
        &self,
        request: MaterializeRequest,
        cancel: &CancelFlag,
    ) -> StoreResult<MaterializeOutcome> {
        let batch = concat(&request.schema, &request.batches)?;
        check_sorted(&batch, &request.order_by)?;
        check_within_box(&batch, &request.tokens, &request.invariant_columns)?;
        let fingerprint = schema_fingerprint(request.schema.as_ref());

        let entry_dir = self.entry_dir(&request.key);
        let set_id = self.next_set_id();
        let mut outcome = MaterializeOutcome {
            set_id: set_id.clone(),
            pages: 0,
            rows: batch.num_rows(),
            committed: false,
            replaced_sets: 0,
        };
        let staging_path = self
            .route_dir(&request.key.route_id)
            .join(format!("{STAGING_PREFIX}{}-{set_id}", request.key.base_key));
        let staging = match StagingDir::create(staging_path) {
            Ok(staging) => staging,
            Err(err) if err.is_not_found() => return Ok(discard_vanished(&request.key, outcome)),
            Err(err) => return Err(err),
        };

        let mut pages = Vec::new();
        for (seq, page) in paginate(&batch, request.rows_per_page).iter().enumerate() {
            let file = format!("{set_id}-{seq:05}.{PAGE_EXTENSION}");
            let crc32 = match write_page(&staging.path.join(&file), page) {
                Ok(crc32) => crc32,
                Err(err) if err.is_not_found() => {
                    return Ok(discard_vanished(&request.key, outcome));
                }
                Err(err) => return Err(err),
            };
            pages.push(PageRef {
                file,
                rows: page.num_rows(),
                crc32,
            });
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
        }

        let now = self.now_ms();
        let ttl_ms = request.ttl.as_millis().min(u128::from(u64::MAX)) as u64;
        let new_set = PageSet {
            set_id: set_id.clone(),
            tokens: request.tokens.clone(),
            pages,
            total_rows: batch.num_rows(),
            created_at_ms: now,
            expires_at_ms: now.saturating_add(ttl_ms),
        };
        outcome.pages = new_set.pages.len();

        let Some(_lock) = ManifestLock::acquire(
            &self.lock_path(&request.key),
            self.inner.config.lock_timeout,
            self.inner.config.stale_lock_after,
        )?
        else {
            info!(
                route_id = %request.key.route_id,
                base_key = %request.key.base_key,
                set_id = %set_id,
                "manifest held by another writer; discarding materialization"
            );
            return Ok(outcome);
        };
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let current = match read_manifest(&entry_dir)? {
            ManifestState::Present(manifest)
                if manifest.schema_fingerprint == fingerprint
                    && manifest.order_by == request.order_by =>
            {
                Some(manifest)
            }
            ManifestState::Present(stale) => {
                debug!(
                    route_id = %request.key.route_id,
                    base_key = %request.key.base_key,
                    "replacing cache entry with incompatible schema or ordering"
                );
                let mut obsolete = Vec::new();
                collect_files(&stale.coverage.sets(), &mut obsolete);
                if !self.commit_fresh(&entry_dir, &staging, &request, &fingerprint, new_set, now)? {
                    return Ok(discard_vanished(&request.key, outcome));
                }
                remove_page_files(&entry_dir, &obsolete);
                outcome.replaced_sets = stale.coverage.sets().len();
                outcome.committed = true;
                return Ok(outcome);
            }
            ManifestState::Corrupt(_) | ManifestState::Absent => None,
        };

        let Some(mut manifest) = current else {
            if !self.commit_fresh(&entry_dir, &staging, &request, &fingerprint, new_set, now)? {
                return Ok(discard_vanished(&request.key, outcome));
            }
            outcome.committed = true;
            return Ok(outcome);
        };

        let mut obsolete_sets: Vec<PageSet> = Vec::new();
        let coverage = match manifest.coverage {
            Coverage::Superset { pages } if !pages.is_expired(now) && !new_set.tokens.is_unconstrained() => {
                // A live superset already answers every box; keep it.
                info!(
                    route_id = %request.key.route_id,
                    base_key = %request.key.base_key,
                    "live superset already present; discarding shard"
                );
                return Ok(outcome);
            }
            existing if new_set.tokens.is_unconstrained() => {
                obsolete_sets.extend(existing_sets(existing));
                Coverage::Superset { pages: new_set }
            }
            existing => {
                let mut shards = Vec::new();
                for set in existing_sets(existing) {
                    if set.is_expired(now) || set.tokens == new_set.tokens {
                        obsolete_sets.push(set);
                    } else {
                        shards.push(set);
                    }
                }
                shards.push(new_set);
                Coverage::Shards { shards }
            }
        };

        if !staging.publish(&entry_dir.join(PAGES_DIR))? {
            return Ok(discard_vanished(&request.key, outcome));
        }
        manifest.coverage = coverage;
        manifest.updated_at_ms = now;
        write_manifest(&entry_dir, &manifest, &set_id)?;

        let mut obsolete = Vec::new();
        collect_files(&obsolete_sets.iter().collect::<Vec<_>>(), &mut obsolete);
        remove_page_files(&entry_dir, &obsolete);
        outcome.replaced_sets = obsolete_sets.len();
        outcome.committed = true;
        info!(
            route_id = %request.key.route_id,
            base_key = %request.key.base_key,
            set_id = %set_id,
            tokens = %request.tokens,
            pages = outcome.pages,
            rows = outcome.rows,
            replaced_sets = outcome.replaced_sets,
            "cache page set committed"
        );
        Ok(outcome)
    }

    fn commit_fresh(
        &self,
        entry_dir: &Path,
        staging: &StagingDir,
        request: &MaterializeRequest,
        fingerprint: &str,
        new_set: PageSet,
        now: u64,
    ) -> StoreResult<bool> {
        if !staging.publish(&entry_dir.join(PAGES_DIR))? {
            return Ok(false);
        }
        let set_id = new_set.set_id.clone();
        let coverage = if new_set.tokens.is_unconstrained() {
            Coverage::Superset { pages: new_set }
        } else {
            Coverage::Shards {
                shards: vec![new_set],
            }
        };
        let manifest = CacheManifest {
            format_version: MANIFEST_FORMAT_VERSION,
            route_id: request.key.route_id.clone(),
            base_key: request.key.base_key.clone(),
            schema_fingerprint: fingerprint.to_string(),
            order_by: request.order_by.clone(),
            coverage,
            updated_at_ms: now,
        };
        write_manifest(entry_dir, &manifest, &set_id)?;
        info!(
            route_id = %request.key.route_id,
            base_key = %request.key.base_key,
            set_id = %set_id,
            tokens = %request.tokens,
            "cache entry created"
        );
        Ok(true)
    }

    /// Returns the page files whose box equals `tokens` exactly, if live.
    pub fn page_set(
        &self,
        key: &EntryKey,
        tokens: &InvariantTokens,
    ) -> StoreResult<Option<PageSetHandle>> {
        let entry_dir = self.entry_dir(key);
        let ManifestState::Present(manifest) = read_manifest(&entry_dir)? else {
            return Ok(None);
        };
        let now = self.now_ms();
        let Some(set) = manifest
            .coverage
            .live_sets(now)
            .into_iter()
            .find(|set| &set.tokens == tokens)
        else {
            return Ok(None);
        };
        let pages_dir = entry_dir.join(PAGES_DIR);
        let pages = set
            .pages
            .iter()
            .map(|page| (pages_dir.join(&page.file), page.crc32))
            .collect::<Vec<_>>();
        let Some((first, _)) = pages.first() else {
            return Ok(None);
        };
        let schema = read_page_schema(first)?;
        if schema_fingerprint(schema.as_ref()) != manifest.schema_fingerprint {
            return Ok(None);
        }
        Ok(Some(PageSetHandle {
            schema,
            pages,
            total_rows: set.total_rows,
        }))
    }

    /// Returns the manifest of an entry for inspection.
    pub fn describe(&self, key: &EntryKey) -> StoreResult<Option<CacheManifest>> {
        match read_manifest(&self.entry_dir(key))? {
            ManifestState::Present(manifest) => Ok(Some(manifest)),
            ManifestState::Absent | ManifestState::Corrupt(_) => Ok(None),
        }
    }

    /// Deletes an entry. Returns whether anything was removed.
    pub fn invalidate(&self, key: &EntryKey) -> StoreResult<bool> {
        let lock = ManifestLock::acquire(
            &self.lock_path(key),
            self.inner.config.lock_timeout,
            self.inner.config.stale_lock_after,
        )?;
        if lock.is_none() {
            warn!(
                route_id = %key.route_id,
                base_key = %key.base_key,
                "invalidating entry without manifest lock"
            );
        }
        self.remove_entry(key)
    }

    /// Removes every entry whose page sets have all expired or whose manifest is unreadable.
    ///
    /// Each entry is judged and removed under its manifest lock; entries held
    /// by a writer are skipped and left for a later sweep.
    pub fn purge_expired(&self) -> StoreResult<usize> {
        let root = &self.inner.config.root;
        let routes = match fs::read_dir(root) {
            Ok(routes) => routes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(StoreError::io(format!("list {}", root.display()), err)),
        };
        let now = self.now_ms();
        let mut purged = 0usize;
        for route in routes {
            let route = route.map_err(|err| StoreError::io("list route dirs", err))?;
            if !route.path().is_dir() {
                continue;
            }
            let entries = fs::read_dir(route.path())
                .map_err(|err| StoreError::io(format!("list {}", route.path().display()), err))?;
            for entry in entries {
                let entry = entry.map_err(|err| StoreError::io("list entries", err))?;
                let entry_dir = entry.path();
                let file_name = entry.file_name();
                let Some(base_key) = file_name.to_str() else {
                    continue;
                };
                if base_key.starts_with('.') || !entry_dir.is_dir() {
                    continue;
                }
                let lock_path = route.path().join(format!("{base_key}.lock"));
                let Some(_lock) = ManifestLock::acquire(
                    &lock_path,
                    INVALIDATION_LOCK_WAIT,
                    self.inner.config.stale_lock_after,
                )?
                else {
                    debug!(entry = %entry_dir.display(), "cache entry busy; skipping purge");
                    continue;
                };
                let dead = match read_manifest(&entry_dir)? {
                    ManifestState::Present(manifest) => manifest.expires_at_ms() <= now,
                    ManifestState::Corrupt(_) => true,
                    ManifestState::Absent => false,
                };
                if dead && self.retire_dir(&entry_dir, base_key)? {
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            info!(purged, root = %root.display(), "purged expired cache entries");
        }
        Ok(purged)
    }

    fn remove_entry(&self, key: &EntryKey) -> StoreResult<bool> {
        self.retire_dir(&self.entry_dir(key), &key.base_key)
    }

    fn retire_dir(&self, entry_dir: &Path, base_key: &str) -> StoreResult<bool> {
        if !entry_dir.exists() {
            return Ok(false);
        }
        // Rename first so concurrent readers observe an absent entry, never a half-deleted one.
        let trash =
            entry_dir.with_file_name(format!("{TRASH_PREFIX}{base_key}-{}", self.next_set_id()));
        match fs::rename(entry_dir, &trash) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(StoreError::io(format!("retire {}", entry_dir.display()), err)),
        }
        fs::remove_dir_all(&trash)
            .map_err(|err| StoreError::io(format!("remove {}", trash.display()), err))?;
        Ok(true)
    }

    /// Best-effort lazy invalidation that never removes a manifest rewritten since it was read.
    fn invalidate_if_unchanged(&self, key: &EntryKey, seen_updated_at_ms: Option<u64>) {
        let Ok(Some(_lock)) = ManifestLock::acquire(
            &self.lock_path(key),
            INVALIDATION_LOCK_WAIT,
            self.inner.config.stale_lock_after,
        ) else {
            return;
        };
        let unchanged = match read_manifest(&self.entry_dir(key)) {
            Ok(ManifestState::Present(manifest)) => {
                seen_updated_at_ms == Some(manifest.updated_at_ms)
            }
            Ok(ManifestState::Corrupt(_)) => seen_updated_at_ms.is_none(),
            Ok(ManifestState::Absent) | Err(_) => false,
        };
        if unchanged {
            if let Err(err) = self.remove_entry(key) {
                warn!(
                    route_id = %key.route_id,
                    base_key = %key.base_key,
                    error = %err,
                    "lazy cache invalidation failed"
                );
            }
        }
    }
}

/// Marker prefix used to tell schema drift apart from other page corruption.
const SCHEMA_DRIFT: &str = "schema drift";

/// Staging directory for one materialization; removed on drop.
struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    fn create(path: PathBuf) -> StoreResult<Self> {
        fs::create_dir_all(&path)
            .map_err(|err| StoreError::io(format!("create {}", path.display()), err))?;
        Ok(Self { path })
    }

    /// Moves every staged page into `pages_dir`.
    ///
    /// Returns `false` when the staged pages disappeared before they could be moved.
    fn publish(&self, pages_dir: &Path) -> StoreResult<bool> {
        fs::create_dir_all(pages_dir)
            .map_err(|err| StoreError::io(format!("create {}", pages_dir.display()), err))?;
        let staged = match fs::read_dir(&self.path) {
            Ok(staged) => staged,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(StoreError::io(format!("list {}", self.path.display()), err)),
        };
        for page in staged {
            let page = page.map_err(|err| StoreError::io("list staged pages", err))?;
            match fs::rename(page.path(), pages_dir.join(page.file_name())) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(err) => return Err(StoreError::io("publish staged page", err)),
            }
        }
        Ok(true)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

fn discard_vanished(key: &EntryKey, outcome: MaterializeOutcome) -> MaterializeOutcome {
    warn!(
        route_id = %key.route_id,
        base_key = %key.base_key,
        set_id = %outcome.set_id,
        "staged pages vanished before commit; discarding materialization"
    );
    outcome
}

fn existing_sets(coverage: Coverage) -> Vec<PageSet> {
    match coverage {
        Coverage::Superset { pages } => vec![pages],
        Coverage::Shards { shards } => shards,
    }
}

fn collect_files(sets: &[&PageSet], out: &mut Vec<String>) {
    for set in sets {
        out.extend(set.files().map(str::to_string));
    }
}

fn remove_page_files(entry_dir: &Path, files: &[String]) {
    let pages_dir = entry_dir.join(PAGES_DIR);
    for file in files {
        let _ = fs::remove_file(pages_dir.join(file));
    }
}

/// Filesystem-safe directory name for a route id.
fn route_dir_name(route_id: &str) -> String {
    let safe = !route_id.is_empty()
        && route_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
        && !route_id.starts_with('.');
    if safe {
        route_id.to_string()
    } else {
        format!("x-{}", hex::encode(route_id.as_bytes()))
    }
}

//! Paged, shard-aware on-disk cache for ordered route results.
//!
//! Results are stored as fixed-size Arrow IPC pages grouped into page sets.
//! Each page set is tagged with the invariant filter box it covers, and the
//! per-entry manifest records whether the entry holds one superset or a
//! collection of shards that may be combined to answer wider requests.

pub mod clock;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod order;
pub mod page;
pub mod shard;
pub mod store;
pub mod tokens;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StoreError, StoreResult};
pub use manifest::{CacheManifest, Coverage, PageRef, PageSet};
pub use order::{describe_order, RowWindow, SortKey};
pub use page::{read_page, PageReadError};
pub use store::{
    CacheRead, CachedRows, CancelFlag, EntryKey, HitSource, LookupRequest, MaterializeOutcome,
    MaterializeRequest, MissReason, PageSetHandle, PagedCacheStore, StoreConfig,
};
pub use tokens::{normalize_token, InvariantColumn, InvariantTokens, MAX_COVERAGE_CELLS};

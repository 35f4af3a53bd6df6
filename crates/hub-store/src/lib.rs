//! # hub-store
//!
//! Persistence primitives for the AI Hub identity subsystem.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  HotCache (moka)        resolved permissions  │
//! ├──────────────────────────────────────────────┤
//! │  TtlStore trait                               │
//! │   ├── MemoryTtlStore (dashmap)  auth codes    │
//! │   └── FileTtlStore              refresh/consent│
//! ├──────────────────────────────────────────────┤
//! │  JsonFile<T>   read → mutate → temp + rename  │
//! │  Clock         system / manual                │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! All stores follow a read-whole-file / mutate / atomic-rename discipline.
//! Writers within one process are serialised per file; writers in separate
//! processes are not coordinated, so a file-backed store must have a single
//! writing process.

pub mod cache;
pub mod clock;
pub mod error;
pub mod file;
pub mod sweep;
pub mod ttl;

// ── re-exports ───────────────────────────────────────────────────────

pub use cache::{CacheStats, HotCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use error::{StoreError, StoreResult};
pub use file::{Change, JsonFile, write_atomic, write_private};
pub use sweep::Sweeper;
pub use ttl::{EntryFilter, Expiring, FileTtlStore, MemoryTtlStore, TtlStore};

//! # Tracevault
//!
//! A restart-surviving page allocator for trace buffers.
//!
//! Tracevault manages a fixed-size memory region that outlives the process
//! (reserved RAM, a memory-mapped file, anything that stays put) and
//! hands out fixed-size pages to per-CPU producers. Allocation state lives
//! *inside* the region as per-CPU bitmaps, so after a crash or reboot the
//! next process can reconstruct exactly which pages the previous session
//! had allocated, per producer and in order, without understanding the page
//! contents.
//!
//! ## Features
//!
//! - **Opaque backing**: the region arrives pre-mapped via the
//!   [`segment::RegionSegment`] trait; heap and mapped-file backends ship
//!   with the crate
//! - **O(1) allocation**: one lock, freelist pop + bitmap bit per call
//! - **Self-describing layout**: a fixed binary header lets a later process
//!   recompute the whole bitmap geometry
//! - **Cold-start recovery**: bitmap walk reconstructs the prior session's
//!   pages, with a pluggable ordering collaborator for true write order
//!
//! ## Quick Start
//!
//! ```rust
//! use tracevault::prelude::*;
//! use std::sync::Arc;
//!
//! // 16 pages of backing memory (use MappedFileSegment to survive restarts).
//! let segment = Arc::new(HeapSegment::new(16 * 4096)?);
//!
//! let config = RegionConfig::new(2, 16, "events", 0);
//! let region = TraceRegion::init(segment, &config)?;
//!
//! // Fresh region: nothing to recover.
//! assert!(region.persistent_session().is_none());
//!
//! // Producers allocate and return pages by offset.
//! let page = region.alloc_page(0)?;
//! region.free_page(page.offset(), 0);
//! # Ok::<(), tracevault::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bitmap;
pub mod error;
pub mod freelist;
pub mod header;
pub mod layout;
mod recovery;
pub mod region;
pub mod segment;
pub mod session;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::region::{PageHandle, RegionConfig, TraceRegion};
    pub use crate::segment::{HeapSegment, MappedFileSegment, RegionSegment};
    pub use crate::session::{PageOrdering, PersistentSession, ScanOrder};
}

pub use error::{Error, Result};

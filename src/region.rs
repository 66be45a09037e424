//! The trace region: mapping, setup, page allocation and teardown.
//!
//! A [`TraceRegion`] is the explicit context object for one restart-surviving
//! memory region. It owns the backing segment, the freelist, the bitmap
//! directory and the allocation counter, all behind a single lock, plus the
//! recovered [`PersistentSession`] when the region carried a prior session.
//!
//! # Lifecycle
//!
//! ```text
//! TraceRegion::map(segment)
//!     ├─ valid header found ──► directory + freelist derived from the
//!     │                         existing bitmaps; session available
//!     └─ no valid header ────► freelist over every page; setup(config)
//!                               writes the header and zeroes the bitmaps
//! ```
//!
//! [`TraceRegion::init`] is the one-call form: map, then set up fresh unless
//! a session was recovered. Producers then call [`TraceRegion::alloc_page`]
//! and [`TraceRegion::free_page`] concurrently from any thread.
//!
//! # Example
//!
//! ```rust
//! use tracevault::region::{RegionConfig, TraceRegion};
//! use tracevault::segment::HeapSegment;
//! use std::sync::Arc;
//!
//! let segment = Arc::new(HeapSegment::new(16 * 4096).unwrap());
//! let config = RegionConfig::new(2, 16, "events", 0);
//!
//! let region = TraceRegion::init(segment, &config).unwrap();
//! assert!(region.persistent_session().is_none()); // fresh region
//!
//! let page = region.alloc_page(0).unwrap();
//! region.free_page(page.offset(), 0);
//! ```

use crate::bitmap::BitmapDirectory;
use crate::error::{Error, Result};
use crate::freelist::FreeList;
use crate::header::RegionHeader;
use crate::layout::{self, RegionGeometry, HEADER_PAGES, PAGE_SIZE};
use crate::recovery;
use crate::segment::RegionSegment;
use crate::session::{PageOrdering, PersistentSession, ScanOrder};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Configuration a fresh session is initialized with.
///
/// Ignored on the recovery path: a recovered region's geometry and identity
/// come from its persisted header, the only self-consistent source.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Number of producers (one bitmap group each).
    pub cpu_count: usize,
    /// Page budget fed to the bitmap sizing loop
    /// ([`layout::bitmap_pages_per_cpu`]).
    pub page_budget: usize,
    /// Name of the tracer owning the session, stored in the header.
    pub tracer_name: String,
    /// Identifier of the trace clock records will be stamped with.
    pub trace_clock: i32,
}

impl RegionConfig {
    /// Build a configuration.
    pub fn new(
        cpu_count: usize,
        page_budget: usize,
        tracer_name: impl Into<String>,
        trace_clock: i32,
    ) -> Self {
        Self {
            cpu_count,
            page_budget,
            tracer_name: tracer_name.into(),
            trace_clock,
        }
    }
}

/// Mutable allocator state, all guarded by one lock so a freelist change
/// and its bitmap bit always commit together.
struct AllocState {
    freelist: FreeList,
    directory: Option<BitmapDirectory>,
    allocated: usize,
    closed: bool,
}

/// One restart-surviving memory region and its page allocator.
pub struct TraceRegion {
    segment: Arc<dyn RegionSegment>,
    base: NonNull<u8>,
    page_count: usize,
    session: Option<PersistentSession>,
    state: Mutex<AllocState>,
}

// SAFETY: the raw base pointer is only dereferenced for pages the allocator
// owns; all mutable state sits behind the Mutex and the segment (which keeps
// the memory alive) is Send + Sync by trait bound.
unsafe impl Send for TraceRegion {}
unsafe impl Sync for TraceRegion {}

impl TraceRegion {
    /// Map a region and attempt recovery, without setting up a fresh session.
    ///
    /// The freelist initially holds *every* page of the region; the header
    /// and bitmap pages are popped off it during [`TraceRegion::setup`],
    /// never pre-excluded. If the region holds a valid prior session, the
    /// directory and freelist are instead derived from the existing bitmaps
    /// (which are not re-zeroed) and the session becomes available through
    /// [`TraceRegion::persistent_session`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSize`] if the segment is empty or smaller than one
    ///   page
    /// - [`Error::MapFailed`] if the segment is not writable
    pub fn map(segment: Arc<dyn RegionSegment>) -> Result<Self> {
        Self::map_with_ordering(segment, &ScanOrder)
    }

    /// [`TraceRegion::map`] with an explicit recovery page-ordering
    /// collaborator.
    pub fn map_with_ordering(
        segment: Arc<dyn RegionSegment>,
        ordering: &dyn PageOrdering,
    ) -> Result<Self> {
        if segment.len() == 0 {
            return Err(Error::InvalidSize("region size must be non-zero".into()));
        }
        let page_count = segment.len() / PAGE_SIZE;
        if page_count == 0 {
            return Err(Error::InvalidSize(format!(
                "region smaller than one {PAGE_SIZE}-byte page"
            )));
        }
        let base = segment
            .as_mut_ptr()
            .and_then(NonNull::new)
            .ok_or_else(|| Error::MapFailed("segment is not writable".into()))?;

        // Recovery runs once, single-threaded, before the region is shared.
        // SAFETY: nothing else references the segment bytes yet.
        let recovered = recovery::recover(unsafe { segment.as_slice() }, ordering);

        let state = match &recovered {
            Some(rec) => {
                let first_data = HEADER_PAGES + rec.geometry.bitmap_page_count();
                let mut freelist = FreeList::with_capacity(page_count);
                let mut allocated = 0;
                for (global_index, &in_use) in rec.allocated.iter().enumerate() {
                    if in_use {
                        allocated += 1;
                    } else {
                        freelist.release((first_data + global_index) as u32);
                    }
                }
                // SAFETY: base spans page_count pages and the directory is
                // the only writer of the bitmap area from here on.
                let directory = unsafe { BitmapDirectory::new(base, rec.geometry) };
                AllocState {
                    freelist,
                    directory: Some(directory),
                    allocated,
                    closed: false,
                }
            }
            None => AllocState {
                freelist: FreeList::with_all_pages(page_count),
                directory: None,
                allocated: 0,
                closed: false,
            },
        };

        Ok(Self {
            segment,
            base,
            page_count,
            session: recovered.map(|rec| rec.session),
            state: Mutex::new(state),
        })
    }

    /// Set up a fresh session: write the header, claim and zero the bitmap
    /// pages, and open the data area for allocation.
    ///
    /// The header page and the bitmap pages are acquired from the freelist
    /// in order, which places them at the front of the region:
    /// `[header][bitmaps][data]`.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyInitialized`] if the region already has a directory
    ///   (a prior `setup`, or a recovered session)
    /// - [`Error::InvalidSize`] if `cpu_count` is zero
    /// - [`Error::InsufficientPages`] if the header and bitmap pages leave
    ///   no data pages, or the bitmap cannot describe the whole data area.
    ///   Fatal: the region never becomes available
    pub fn setup(&mut self, config: &RegionConfig) -> Result<()> {
        let mut state = self.lock_state();
        if state.directory.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        if config.cpu_count == 0 {
            return Err(Error::InvalidSize("cpu count must be non-zero".into()));
        }

        let pages_per_cpu = layout::bitmap_pages_per_cpu(config.cpu_count, config.page_budget);
        let geometry = RegionGeometry::new(config.cpu_count, pages_per_cpu, self.page_count);
        let metadata_pages = HEADER_PAGES + geometry.bitmap_page_count();
        if metadata_pages >= self.page_count {
            return Err(Error::InsufficientPages(format!(
                "{metadata_pages} metadata pages leave no data pages in a {}-page region",
                self.page_count
            )));
        }
        if geometry.data_page_count() > geometry.bit_capacity_per_cpu() {
            return Err(Error::InsufficientPages(format!(
                "bitmap capacity of {} pages cannot describe {} data pages",
                geometry.bit_capacity_per_cpu(),
                geometry.data_page_count()
            )));
        }

        // Header page first. The freelist is fresh and FIFO, so this is
        // page 0 and the next acquires are the pages right behind it.
        let header_page = state
            .freelist
            .acquire()
            .ok_or_else(|| Error::InsufficientPages("no page left for the header".into()))?;
        debug_assert_eq!(header_page, 0);

        let header = RegionHeader::new(
            config.cpu_count as i32,
            config.trace_clock,
            pages_per_cpu as i32,
            &config.tracer_name,
        );
        // SAFETY: page 0 is in bounds and exclusively ours once acquired.
        let header_bytes = unsafe {
            std::slice::from_raw_parts_mut(
                self.base.as_ptr().add(header_page as usize * PAGE_SIZE),
                PAGE_SIZE,
            )
        };
        header.encode(header_bytes)?;

        for i in 0..geometry.bitmap_page_count() {
            let page = state.freelist.acquire().ok_or_else(|| {
                Error::InsufficientPages(format!(
                    "ran out of pages while claiming bitmap page {i}"
                ))
            })?;
            debug_assert_eq!(page as usize, HEADER_PAGES + i);
        }

        // SAFETY: base spans page_count pages; the bitmap pages were just
        // taken off the freelist and belong to the directory alone.
        let mut directory = unsafe { BitmapDirectory::new(self.base, geometry) };
        directory.zero();
        state.directory = Some(directory);

        tracing::debug!(
            cpus = config.cpu_count,
            bitmap_pages = geometry.bitmap_page_count(),
            data_pages = geometry.data_page_count(),
            tracer = %config.tracer_name,
            "region initialized"
        );
        Ok(())
    }

    /// Map a region and, unless a prior session was recovered, set up a
    /// fresh one. The single entry point for normal use.
    ///
    /// # Errors
    ///
    /// Everything [`TraceRegion::map`] and [`TraceRegion::setup`] return.
    pub fn init(segment: Arc<dyn RegionSegment>, config: &RegionConfig) -> Result<Self> {
        Self::init_with_ordering(segment, config, &ScanOrder)
    }

    /// [`TraceRegion::init`] with an explicit recovery page-ordering
    /// collaborator.
    pub fn init_with_ordering(
        segment: Arc<dyn RegionSegment>,
        config: &RegionConfig,
        ordering: &dyn PageOrdering,
    ) -> Result<Self> {
        let mut region = Self::map_with_ordering(segment, ordering)?;
        if region.session.is_none() {
            region.setup(config)?;
        }
        Ok(region)
    }

    /// Allocate one page for `cpu`.
    ///
    /// The page is taken off the freelist, zeroed, and its bitmap bit set.
    /// Freelist, bit and counter all change inside one critical section, so
    /// the freelist/bitmap invariant holds at every observable point.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfPages`] when no free page is available (or the region
    /// was never set up, or has been closed). Recoverable; region state is
    /// unchanged by the failed call.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is outside the configured CPU count.
    pub fn alloc_page(&self, cpu: usize) -> Result<PageHandle> {
        let offset;
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            if state.closed {
                return Err(Error::OutOfPages);
            }
            let Some(directory) = state.directory.as_mut() else {
                // Mapped but never set up: there is no data area to serve.
                return Err(Error::OutOfPages);
            };
            let geometry = *directory.geometry();
            assert!(cpu < geometry.cpu_count, "cpu index out of range");

            let Some(page) = state.freelist.acquire() else {
                tracing::trace!(cpu, "allocation failed, no free pages");
                return Err(Error::OutOfPages);
            };

            offset = page as usize * PAGE_SIZE;
            // The freelist only ever holds data pages once the region is set
            // up, so the offset always resolves to a global index.
            let global_index = (offset - geometry.data_start()) / PAGE_SIZE;
            directory.set(cpu, global_index);
            state.allocated += 1;
        }

        // Zero outside the lock: the page is privately owned once popped.
        // SAFETY: offset is a page inside the region, exclusively ours.
        unsafe {
            std::ptr::write_bytes(self.base.as_ptr().add(offset), 0, PAGE_SIZE);
        }

        tracing::trace!(cpu, offset, "page allocated");
        Ok(PageHandle {
            segment: Arc::clone(&self.segment),
            // SAFETY: base + offset is non-null and in bounds.
            ptr: unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) },
            offset,
        })
    }

    /// Return the page at `offset` to the freelist on behalf of `cpu`.
    ///
    /// A double free, or an offset outside the data area, is a silent no-op:
    /// the bit is already clear, so there is nothing to undo and nothing to
    /// report.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is outside the configured CPU count.
    pub fn free_page(&self, offset: usize, cpu: usize) {
        let mut state = self.lock_state();
        let state = &mut *state;
        if state.closed {
            return;
        }
        let Some(directory) = state.directory.as_mut() else {
            return;
        };
        let geometry = *directory.geometry();
        assert!(cpu < geometry.cpu_count, "cpu index out of range");

        let Some(global_index) = geometry.global_index(offset) else {
            tracing::warn!(offset, "ignoring free of an offset outside the data area");
            return;
        };
        if global_index >= geometry.bit_capacity_per_cpu() {
            return;
        }
        if !directory.test(cpu, global_index) {
            tracing::trace!(cpu, offset, "ignoring free of an unallocated page");
            return;
        }

        state.freelist.release((offset / PAGE_SIZE) as u32);
        directory.clear(cpu, global_index);
        state.allocated -= 1;
        tracing::trace!(cpu, offset, "page freed");
    }

    /// A handle to the data page at `offset`, if it lies in the data area.
    ///
    /// Meant for consumers walking a recovered session's pages; the
    /// allocator does not track whether the page is currently allocated.
    pub fn page(&self, offset: usize) -> Option<PageHandle> {
        let state = self.lock_state();
        let geometry = *state.directory.as_ref()?.geometry();
        let global_index = geometry.global_index(offset)?;
        let page_offset = geometry.page_offset(global_index);
        Some(PageHandle {
            segment: Arc::clone(&self.segment),
            // SAFETY: the offset was just checked against the data area.
            ptr: unsafe { NonNull::new_unchecked(self.base.as_ptr().add(page_offset)) },
            offset: page_offset,
        })
    }

    /// The session a prior process left in this region, if one was
    /// recovered. `None` for the whole lifetime of a fresh region.
    pub fn persistent_session(&self) -> Option<&PersistentSession> {
        self.session.as_ref()
    }

    /// Total pages in the region, header and bitmaps included.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Size of every page, in bytes.
    pub fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// The region geometry, once set up or recovered.
    pub fn geometry(&self) -> Option<RegionGeometry> {
        self.lock_state()
            .directory
            .as_ref()
            .map(|directory| *directory.geometry())
    }

    /// Number of data pages available to producers in total.
    pub fn data_page_count(&self) -> usize {
        self.geometry().map_or(0, |g| g.data_page_count())
    }

    /// Number of currently allocated pages.
    pub fn allocated_pages(&self) -> usize {
        self.lock_state().allocated
    }

    /// Number of currently free pages.
    pub fn free_pages(&self) -> usize {
        self.lock_state().freelist.len()
    }

    /// Returns true if the next allocation would fail with
    /// [`Error::OutOfPages`].
    pub fn is_exhausted(&self) -> bool {
        self.lock_state().freelist.is_empty()
    }

    /// Tear the region down: flush the backing store and stop handing out
    /// pages. Idempotent; also runs on drop.
    ///
    /// The region image (header, bitmaps, allocated page contents) is left
    /// intact so a later process can recover the session.
    pub fn close(&mut self) {
        {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.freelist.clear();
        }
        if let Err(error) = self.segment.sync() {
            tracing::warn!(%error, "failed to sync region backing");
        }
        tracing::debug!("region closed");
    }

    fn lock_state(&self) -> MutexGuard<'_, AllocState> {
        // A poisoned lock only means a panic elsewhere; the state itself is
        // kept consistent at every unlock point.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TraceRegion {
    fn drop(&mut self) {
        self.close();
    }
}

/// A page handed out by [`TraceRegion::alloc_page`].
///
/// Not an RAII guard: pages stay allocated until explicitly returned with
/// [`TraceRegion::free_page`], because an allocated page must remain
/// allocated across a process restart. Dropping the handle drops access,
/// not the allocation. The handle keeps the backing segment alive.
pub struct PageHandle {
    segment: Arc<dyn RegionSegment>,
    ptr: NonNull<u8>,
    offset: usize,
}

impl PageHandle {
    /// Region byte offset of this page: the stable name to pass to
    /// [`TraceRegion::free_page`] and the one recovery reports.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the page in bytes.
    pub fn len(&self) -> usize {
        PAGE_SIZE
    }

    /// Returns true if the page has zero size (it never does).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The page contents.
    pub fn data(&self) -> &[u8] {
        // SAFETY: ptr spans one page inside the segment this handle keeps
        // alive; the allocator hands each page to at most one producer.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), PAGE_SIZE) }
    }

    /// The page contents, writable.
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, plus &mut self for exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), PAGE_SIZE) }
    }

    /// Raw pointer to the page start.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

// SAFETY: the handle is an offset plus a pointer into a segment it keeps
// alive via Arc; producers own their pages exclusively between alloc and
// free.
unsafe impl Send for PageHandle {}
unsafe impl Sync for PageHandle {}

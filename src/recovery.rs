//! Startup recovery: rebuilding a prior session from the region's bitmaps.
//!
//! Runs exactly once, single-threaded, while the region is being mapped and
//! before it is published for allocation. The engine decodes the header; if
//! it marks a valid prior session, the bitmap directory geometry is
//! recomputed from the header alone (nothing is re-zeroed) and every per-CPU
//! group is walked, bitmap pages in increasing order, bits low-to-high.
//! Each set bit names a data page the prior session had allocated; page
//! *contents* are never touched here, only the [`PageOrdering`]
//! collaborator knows what is inside them.
//!
//! There is no checksum. A header that passes the non-empty-string check
//! but describes the wrong geometry is accepted and may reconstruct
//! nonsense; all scans are clamped to the actual region so it can never
//! read out of bounds.

use crate::header::RegionHeader;
use crate::layout::{RegionGeometry, HEADER_PAGES, PAGE_SIZE};
use crate::session::{PageOrdering, PersistentSession};

/// Everything `map` needs to resume from a prior session: the geometry
/// derived from the header, the session snapshot, and which trackable data
/// pages are currently allocated (for rebuilding the freelist and counter).
pub(crate) struct RecoveredState {
    pub geometry: RegionGeometry,
    pub session: PersistentSession,
    /// `allocated[global_index]` for every trackable data page.
    pub allocated: Vec<bool>,
}

/// Attempt recovery over a mapped region image.
///
/// Returns `None` when the region holds no decodable prior session; the
/// caller then takes the fresh-initialization path. This is deliberately
/// not an error: an all-zero region is the normal first boot.
pub(crate) fn recover(region: &[u8], ordering: &dyn PageOrdering) -> Option<RecoveredState> {
    let header_page = &region[..region.len().min(PAGE_SIZE)];
    let header = RegionHeader::decode(header_page);
    if !header.is_valid() {
        tracing::debug!("no prior session in region");
        return None;
    }

    let cpu_count = usize::try_from(header.cpu_count).ok()?;
    let bitmap_pages_per_cpu = usize::try_from(header.bitmap_pages_per_cpu).ok()?;
    let page_count = region.len() / PAGE_SIZE;
    let geometry = RegionGeometry::new(cpu_count, bitmap_pages_per_cpu, page_count);

    // A directory that does not even fit the region cannot be walked;
    // treat the region as fresh.
    if HEADER_PAGES + geometry.bitmap_page_count() > page_count {
        tracing::warn!(
            cpu_count,
            bitmap_pages_per_cpu,
            page_count,
            "header describes a directory larger than the region, ignoring it"
        );
        return None;
    }

    // Bits past either the data area or the group's capacity are ignored.
    let trackable = geometry
        .data_page_count()
        .min(geometry.bit_capacity_per_cpu());

    let mut allocated = vec![false; trackable];
    let mut pages_by_cpu = Vec::with_capacity(cpu_count);

    for cpu in 0..cpu_count {
        let mut pages = Vec::new();
        for global_index in 0..trackable {
            if test_bit(region, &geometry, cpu, global_index) {
                allocated[global_index] = true;
                pages.push(geometry.page_offset(global_index));
            }
        }
        tracing::debug!(cpu, pages = pages.len(), "scanned bitmap group");
        pages_by_cpu.push(ordering.order_pages(cpu, pages));
    }

    let session = PersistentSession::new(header.tracer_name.clone(), header.trace_clock, pages_by_cpu);
    tracing::debug!(
        tracer = %header.tracer_name,
        build = %header.build_id,
        cpus = cpu_count,
        pages = session.page_count(),
        "recovered prior session"
    );

    Some(RecoveredState {
        geometry,
        session,
        allocated,
    })
}

/// Read one allocation bit straight from the region image.
fn test_bit(region: &[u8], geometry: &RegionGeometry, cpu: usize, global_index: usize) -> bool {
    let slot = geometry.bit_slot(cpu, global_index);
    let at = (HEADER_PAGES + slot.directory_page) * PAGE_SIZE + slot.byte;
    match region.get(at) {
        Some(byte) => byte & slot.mask != 0,
        None => false,
    }
}

// Copyright 2025 The sysmmu Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! The IO virtual memory manager.
//!
//! An [`IoVirtualMemory`] hands out non-overlapping IO virtual ranges from
//! fixed address windows ("planes"), tracked by a bit-per-page occupancy
//! bitmap and a region list for reverse lookup. Scatter-gather buffers are
//! coalesced greedily so the translation engine can use the largest granules
//! the addresses allow, and a failed mapping is torn down completely before
//! the error propagates.
//!
//! The manager's own lock guards the bitmap and region list as one unit and
//! is never held across a call into the translation domain, whose locks are
//! independent.

use crate::domain::IommuOps;
use crate::paging::{
    align_down, align_up, is_aligned, IoVirtualAddress, PhysicalAddress, IOVA_END, PAGE_SHIFT,
    PAGE_SIZE, SECTION_SIZE,
};
use crate::Prot;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Display, Formatter};
use log::warn;
use spin::Mutex;
use thiserror::Error;

/// One physically-contiguous piece of a DMA buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SgEntry {
    pub pa: PhysicalAddress,
    pub len: usize,
}

/// Errors from the IO virtual memory manager.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum IovmmError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// No free IO virtual range of the requested size and alignment.
    #[error("no IO virtual space for {requested:#x} bytes")]
    OutOfSpace { requested: usize },
    /// Region bookkeeping allocation failed.
    #[error("out of memory for region bookkeeping")]
    OutOfMemory,
    /// A one-to-one mapping collides with an existing region.
    #[error("range at {0} overlaps an existing region")]
    Overlap(IoVirtualAddress),
    /// The translation engine refused the mapping; the IO virtual range has
    /// been released again.
    #[error(transparent)]
    Map(#[from] crate::MapError),
}

const WORD_BITS: usize = usize::BITS as usize;

/// Bit-per-page occupancy of one plane.
struct Bitmap {
    words: Vec<usize>,
    len: usize,
}

impl Bitmap {
    fn new(pages: usize) -> Self {
        Self {
            words: alloc::vec![0; pages.div_ceil(WORD_BITS)],
            len: pages,
        }
    }

    fn set_range(&mut self, start: usize, len: usize) {
        for index in start..start + len {
            self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        }
    }

    fn clear_range(&mut self, start: usize, len: usize) {
        for index in start..start + len {
            self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        }
    }

    #[cfg(test)]
    fn is_set(&self, index: usize) -> bool {
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// First set bit in `[start, end)`, if any.
    fn first_set_in(&self, start: usize, end: usize) -> Option<usize> {
        let mut index = start;
        while index < end {
            let word = self.words[index / WORD_BITS] >> (index % WORD_BITS);
            if word == 0 {
                index = (index / WORD_BITS + 1) * WORD_BITS;
                continue;
            }
            let found = index + word.trailing_zeros() as usize;
            return if found < end { Some(found) } else { None };
        }
        None
    }

    /// First-fit scan for `pages` clear bits.
    ///
    /// Candidate positions are multiples of `align`, or, with
    /// `exact = (max_align, residue)`, positions whose index modulo
    /// `max_align` equals `residue` (so the result can share the caller's
    /// physical alignment phase and still satisfy the larger hardware
    /// alignment).
    fn find_zero_run(
        &self,
        pages: usize,
        align: usize,
        exact: Option<(usize, usize)>,
    ) -> Option<usize> {
        let (step, origin) = match exact {
            Some((max_align, residue)) => (max_align, residue),
            None => (align.max(1), 0),
        };
        let mut start = origin;
        while start + pages <= self.len {
            match self.first_set_in(start, start + pages) {
                None => return Some(start),
                Some(conflict) => {
                    start = origin + align_up(conflict + 1 - origin, step);
                }
            }
        }
        None
    }
}

/// Where a region's pages are accounted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum RegionKind {
    /// Allocated from a plane's bitmap.
    Allocated { plane: usize },
    /// A one-to-one carve-out; `plane` is set when the range happens to fall
    /// inside a plane window and its bitmap bits are reserved.
    Fixed { plane: Option<usize> },
}

/// One outstanding IO virtual allocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct VmRegion {
    start: usize,
    size: usize,
    kind: RegionKind,
}

struct Plane {
    base: usize,
    size: usize,
    bitmap: Bitmap,
    allocated_bytes: usize,
}

impl Plane {
    fn contains(&self, start: usize, size: usize) -> bool {
        start >= self.base && start + size <= self.base + self.size
    }
}

struct VmState {
    planes: Vec<Plane>,
    regions: Vec<VmRegion>,
    num_map: usize,
    num_unmap: usize,
}

/// Cumulative counters, surfaced for diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VmStats {
    pub num_map: usize,
    pub num_unmap: usize,
    pub allocated_bytes: usize,
}

/// The IO virtual address space of one master device.
pub struct IoVirtualMemory {
    master: String,
    state: Mutex<VmState>,
}

impl IoVirtualMemory {
    /// Creates a manager over the given `(base, size)` plane windows.
    pub fn new(
        master: impl Into<String>,
        planes: &[(usize, usize)],
    ) -> Result<Self, IovmmError> {
        if planes.is_empty() {
            return Err(IovmmError::InvalidArgument("at least one plane is required"));
        }
        let mut built = Vec::new();
        for &(base, size) in planes {
            if size == 0 || !is_aligned(base | size, PAGE_SIZE) {
                return Err(IovmmError::InvalidArgument(
                    "plane windows must be page-aligned and non-empty",
                ));
            }
            if base + size > IOVA_END {
                return Err(IovmmError::InvalidArgument(
                    "plane window exceeds the IO virtual address space",
                ));
            }
            if built
                .iter()
                .any(|p: &Plane| base < p.base + p.size && p.base < base + size)
            {
                return Err(IovmmError::InvalidArgument("plane windows overlap"));
            }
            built.push(Plane {
                base,
                size,
                bitmap: Bitmap::new(size / PAGE_SIZE),
                allocated_bytes: 0,
            });
        }
        Ok(Self {
            master: master.into(),
            state: Mutex::new(VmState {
                planes: built,
                regions: Vec::new(),
                num_map: 0,
                num_unmap: 0,
            }),
        })
    }

    /// Maps bytes `[offset, offset + size)` of the scatter-gather buffer into
    /// plane `plane` and returns the IO virtual address of the first byte.
    ///
    /// Physically-contiguous entries are coalesced before mapping so large
    /// granules can be used; the allocated range keeps the physical section
    /// phase when the mapping is big enough for section granules. On any
    /// failure partway through, everything this call mapped is unmapped and
    /// the range is released before the error returns.
    pub fn map(
        &self,
        domain: &dyn IommuOps,
        plane: usize,
        sg: &[SgEntry],
        offset: usize,
        size: usize,
        prot: Prot,
    ) -> Result<IoVirtualAddress, IovmmError> {
        if offset >= PAGE_SIZE {
            return Err(IovmmError::InvalidArgument(
                "offset must be smaller than a page",
            ));
        }
        if size == 0 {
            return Err(IovmmError::InvalidArgument("size must be non-zero"));
        }
        let map_size = align_up(offset + size, PAGE_SIZE);
        let chunks = coalesce(sg, map_size)?;
        let pages = map_size / PAGE_SIZE;

        // Alignment grows with the allocation so the engine can use large
        // granules; section-sized mappings additionally keep the physical
        // section phase.
        let section_pages = SECTION_SIZE / PAGE_SIZE;
        let align = pages.next_power_of_two().min(section_pages);
        let first_pa = chunks[0].0;
        let exact = (map_size >= SECTION_SIZE)
            .then(|| (section_pages, (first_pa.0 >> PAGE_SHIFT) % section_pages));

        let start = {
            let mut state = self.state.lock();
            let plane_ref = state
                .planes
                .get_mut(plane)
                .ok_or(IovmmError::InvalidArgument("no such plane"))?;
            let index = plane_ref
                .bitmap
                .find_zero_run(pages, align, exact)
                .ok_or(IovmmError::OutOfSpace {
                    requested: map_size,
                })?;
            plane_ref.bitmap.set_range(index, pages);
            let start = plane_ref.base + index * PAGE_SIZE;
            if state.regions.try_reserve(1).is_err() {
                let plane_ref = &mut state.planes[plane];
                plane_ref.bitmap.clear_range(index, pages);
                return Err(IovmmError::OutOfMemory);
            }
            state.regions.push(VmRegion {
                start,
                size: map_size,
                kind: RegionKind::Allocated { plane },
            });
            start
        };

        let mut mapped = 0;
        for &(pa, len) in &chunks {
            if let Err(e) = domain.map(IoVirtualAddress(start + mapped), pa, len, prot) {
                unmap_span(domain, start, mapped);
                self.drop_region(start);
                return Err(IovmmError::Map(e));
            }
            mapped += len;
        }

        let mut state = self.state.lock();
        state.num_map += 1;
        state.planes[plane].allocated_bytes += map_size;
        Ok(IoVirtualAddress(start + offset))
    }

    /// Unmaps the region `map` returned `iova` for, releasing its IO virtual
    /// range. Returns the number of bytes released, zero if no region matches.
    pub fn unmap(&self, domain: &dyn IommuOps, iova: IoVirtualAddress) -> usize {
        let start = align_down(iova.0, PAGE_SIZE);
        let region = {
            let mut state = self.state.lock();
            let Some(position) = state.regions.iter().position(|r| {
                r.start == start && matches!(r.kind, RegionKind::Allocated { .. })
            }) else {
                warn!("iovmm {}: unmap of unknown address {}", self.master, iova);
                return 0;
            };
            let region = state.regions.swap_remove(position);
            let RegionKind::Allocated { plane } = region.kind else {
                unreachable!()
            };
            let plane_base = state.planes[plane].base;
            let plane_ref = &mut state.planes[plane];
            plane_ref
                .bitmap
                .clear_range((region.start - plane_base) / PAGE_SIZE, region.size / PAGE_SIZE);
            plane_ref.allocated_bytes -= region.size;
            state.num_unmap += 1;
            region
        };
        unmap_span(domain, region.start, region.size);
        region.size
    }

    /// Installs a fixed one-to-one mapping at `pa`. Used for carve-outs whose
    /// IO virtual address must equal the physical address; the bitmap is
    /// bypassed except when the range falls inside a plane window, in which
    /// case its pages are reserved there too.
    pub fn map_oto(
        &self,
        domain: &dyn IommuOps,
        pa: PhysicalAddress,
        size: usize,
        prot: Prot,
    ) -> Result<IoVirtualAddress, IovmmError> {
        if size == 0 || !is_aligned(pa.0, PAGE_SIZE) {
            return Err(IovmmError::InvalidArgument(
                "one-to-one ranges must start page-aligned and be non-empty",
            ));
        }
        let start = pa.0;
        let map_size = align_up(size, PAGE_SIZE);
        {
            let mut state = self.state.lock();
            if state
                .regions
                .iter()
                .any(|r| r.start < start + map_size && start < r.start + r.size)
            {
                return Err(IovmmError::Overlap(IoVirtualAddress(start)));
            }
            if state.regions.try_reserve(1).is_err() {
                return Err(IovmmError::OutOfMemory);
            }
            let plane = state
                .planes
                .iter()
                .position(|p| p.contains(start, map_size));
            if let Some(plane) = plane {
                let plane_ref = &mut state.planes[plane];
                let index = (start - plane_ref.base) / PAGE_SIZE;
                plane_ref.bitmap.set_range(index, map_size / PAGE_SIZE);
                plane_ref.allocated_bytes += map_size;
            }
            state.regions.push(VmRegion {
                start,
                size: map_size,
                kind: RegionKind::Fixed { plane },
            });
            state.num_map += 1;
        }
        if let Err(e) = domain.map(IoVirtualAddress(start), pa, map_size, prot) {
            self.drop_region(start);
            return Err(IovmmError::Map(e));
        }
        Ok(IoVirtualAddress(start))
    }

    /// Removes a one-to-one mapping installed by [`map_oto`](Self::map_oto).
    pub fn unmap_oto(&self, domain: &dyn IommuOps, pa: PhysicalAddress) -> usize {
        let region = {
            let mut state = self.state.lock();
            let Some(position) = state
                .regions
                .iter()
                .position(|r| r.start == pa.0 && matches!(r.kind, RegionKind::Fixed { .. }))
            else {
                warn!(
                    "iovmm {}: one-to-one unmap of unknown address {}",
                    self.master, pa
                );
                return 0;
            };
            let region = state.regions.swap_remove(position);
            if let RegionKind::Fixed { plane: Some(plane) } = region.kind {
                let plane_base = state.planes[plane].base;
                let plane_ref = &mut state.planes[plane];
                plane_ref
                    .bitmap
                    .clear_range((region.start - plane_base) / PAGE_SIZE, region.size / PAGE_SIZE);
                plane_ref.allocated_bytes -= region.size;
            }
            state.num_unmap += 1;
            region
        };
        unmap_span(domain, region.start, region.size);
        region.size
    }

    /// The region containing `iova`, as `(start, size)`. Used for unmap
    /// lookups and to classify faulting addresses.
    pub fn find_region(&self, iova: IoVirtualAddress) -> Option<(IoVirtualAddress, usize)> {
        self.state
            .lock()
            .regions
            .iter()
            .find(|r| r.start <= iova.0 && iova.0 < r.start + r.size)
            .map(|r| (IoVirtualAddress(r.start), r.size))
    }

    pub fn stats(&self) -> VmStats {
        let state = self.state.lock();
        VmStats {
            num_map: state.num_map,
            num_unmap: state.num_unmap,
            allocated_bytes: state.planes.iter().map(|p| p.allocated_bytes).sum(),
        }
    }

    /// Removes a region inserted by a mapping call that failed partway, and
    /// returns its pages to the bitmap.
    fn drop_region(&self, start: usize) {
        let mut state = self.state.lock();
        let Some(position) = state.regions.iter().position(|r| r.start == start) else {
            return;
        };
        let region = state.regions.swap_remove(position);
        let plane = match region.kind {
            RegionKind::Allocated { plane } => Some(plane),
            RegionKind::Fixed { plane } => plane,
        };
        if let Some(plane) = plane {
            let plane_base = state.planes[plane].base;
            state.planes[plane]
                .bitmap
                .clear_range((region.start - plane_base) / PAGE_SIZE, region.size / PAGE_SIZE);
        }
    }

    /// Verifies the bitmap agrees with the region list bit for bit.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let state = self.state.lock();
        for (plane_index, plane) in state.planes.iter().enumerate() {
            for page in 0..plane.size / PAGE_SIZE {
                let address = plane.base + page * PAGE_SIZE;
                let in_region = state.regions.iter().any(|r| {
                    let in_plane = match r.kind {
                        RegionKind::Allocated { plane } => plane == plane_index,
                        RegionKind::Fixed { plane } => plane == Some(plane_index),
                    };
                    in_plane && r.start <= address && address < r.start + r.size
                });
                assert_eq!(
                    plane.bitmap.is_set(page),
                    in_region,
                    "bitmap and region list disagree at {address:#x}"
                );
            }
        }
    }
}

impl Display for IoVirtualMemory {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        let state = self.state.lock();
        writeln!(f, "iovmm of {}:", self.master)?;
        for (index, plane) in state.planes.iter().enumerate() {
            let regions = state
                .regions
                .iter()
                .filter(|r| match r.kind {
                    RegionKind::Allocated { plane } => plane == index,
                    RegionKind::Fixed { plane } => plane == Some(index),
                })
                .count();
            writeln!(
                f,
                "  plane {}: [{:#010x}..{:#010x}] {} regions, {:#x} bytes used, {:#x} free",
                index,
                plane.base,
                plane.base + plane.size,
                regions,
                plane.allocated_bytes,
                plane.size - plane.allocated_bytes,
            )?;
        }
        write!(
            f,
            "  {} mappings, {} unmappings",
            state.num_map, state.num_unmap
        )
    }
}

/// Merges physically-adjacent scatter entries and truncates the result to
/// `map_size` bytes.
fn coalesce(sg: &[SgEntry], map_size: usize) -> Result<Vec<(PhysicalAddress, usize)>, IovmmError> {
    if sg.is_empty() {
        return Err(IovmmError::InvalidArgument("empty scatter list"));
    }
    let mut chunks: Vec<(PhysicalAddress, usize)> = Vec::new();
    let mut total = 0;
    for entry in sg {
        if entry.len == 0 || !is_aligned(entry.pa.0 | entry.len, PAGE_SIZE) {
            return Err(IovmmError::InvalidArgument(
                "scatter entries must be whole pages",
            ));
        }
        if total >= map_size {
            break;
        }
        let take = entry.len.min(map_size - total);
        match chunks.last_mut() {
            Some((pa, len)) if pa.0 + *len == entry.pa.0 => *len += take,
            _ => chunks.push((entry.pa, take)),
        }
        total += take;
    }
    if total < map_size {
        return Err(IovmmError::InvalidArgument(
            "scatter list shorter than the mapping",
        ));
    }
    Ok(chunks)
}

/// Unmaps `[start, start + size)` granule by granule, trusting the engine to
/// report each granule's actual size.
fn unmap_span(domain: &dyn IommuOps, start: usize, size: usize) {
    let mut undone = 0;
    while undone < size {
        let n = domain.unmap(IoVirtualAddress(start + undone), size - undone);
        if n == 0 {
            warn!(
                "translation teardown stalled at {:#x}, {:#x} bytes left",
                start + undone,
                size - undone
            );
            break;
        }
        undone += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IommuOps, TranslationDomain};
    use crate::paging::{
        Lv1Table, Lv2Table, PageSizes, TableAllocator, LPAGE_SIZE, SUPERSECTION_SIZE,
    };
    use crate::{HeapTables, SysMmu};
    use alloc::vec;
    use core::ptr::NonNull;

    const PLANE_BASE: usize = 0x1000_0000;
    const PLANE_SIZE: usize = 1 << 31;

    fn make_domain() -> TranslationDomain<HeapTables> {
        let ctx = SysMmu::new(HeapTables::new()).unwrap();
        TranslationDomain::new(ctx, PageSizes::BASE, None).unwrap()
    }

    fn make_vm() -> IoVirtualMemory {
        IoVirtualMemory::new("fimd", &[(PLANE_BASE, PLANE_SIZE)]).unwrap()
    }

    fn one_chunk(pa: usize, len: usize) -> Vec<SgEntry> {
        vec![SgEntry {
            pa: PhysicalAddress(pa),
            len,
        }]
    }

    #[test]
    fn allocations_are_disjoint_and_first_fit() {
        let domain = make_domain();
        let vm = make_vm();

        let a = vm
            .map(&domain, 0, &one_chunk(0x8000_0000, PAGE_SIZE), 0, PAGE_SIZE, Prot::READ)
            .unwrap();
        let b = vm
            .map(&domain, 0, &one_chunk(0x8010_0000, LPAGE_SIZE), 0, LPAGE_SIZE, Prot::READ)
            .unwrap();
        let c = vm
            .map(
                &domain,
                0,
                &one_chunk(0x8100_0000, SECTION_SIZE),
                0,
                SECTION_SIZE,
                Prot::READ,
            )
            .unwrap();

        for &(start, size) in &[(a, PAGE_SIZE), (b, LPAGE_SIZE), (c, SECTION_SIZE)] {
            assert!(is_aligned(start.0, PAGE_SIZE));
            assert!(start.0 >= PLANE_BASE && start.0 + size <= PLANE_BASE + PLANE_SIZE);
        }
        // Pairwise disjoint.
        let ranges = [(a.0, PAGE_SIZE), (b.0, LPAGE_SIZE), (c.0, SECTION_SIZE)];
        for (i, &(s1, l1)) in ranges.iter().enumerate() {
            for &(s2, l2) in &ranges[i + 1..] {
                assert!(s1 + l1 <= s2 || s2 + l2 <= s1);
            }
        }
        vm.assert_consistent();

        // Freeing the 64 KiB region and allocating again reuses it first-fit.
        assert_eq!(vm.unmap(&domain, b), LPAGE_SIZE);
        let b2 = vm
            .map(&domain, 0, &one_chunk(0x8020_0000, LPAGE_SIZE), 0, LPAGE_SIZE, Prot::READ)
            .unwrap();
        assert_eq!(b2, b);
        vm.assert_consistent();
    }

    #[test]
    fn mapping_translates_through_the_domain() {
        let domain = make_domain();
        let vm = make_vm();
        // Two contiguous pages then a disjoint large-page run.
        let sg = vec![
            SgEntry {
                pa: PhysicalAddress(0x8000_0000),
                len: PAGE_SIZE,
            },
            SgEntry {
                pa: PhysicalAddress(0x8000_1000),
                len: PAGE_SIZE,
            },
            SgEntry {
                pa: PhysicalAddress(0x9000_0000),
                len: LPAGE_SIZE,
            },
        ];
        let size = 2 * PAGE_SIZE + LPAGE_SIZE;
        let iova = vm.map(&domain, 0, &sg, 0, size, Prot::READ | Prot::WRITE).unwrap();

        assert_eq!(
            domain.iova_to_phys(iova),
            Some(PhysicalAddress(0x8000_0000))
        );
        assert_eq!(
            domain.iova_to_phys(iova + PAGE_SIZE + 0x10),
            Some(PhysicalAddress(0x8000_1010))
        );
        assert_eq!(
            domain.iova_to_phys(iova + 2 * PAGE_SIZE),
            Some(PhysicalAddress(0x9000_0000))
        );

        assert_eq!(vm.unmap(&domain, iova), size);
        assert_eq!(domain.iova_to_phys(iova), None);
        assert_eq!(vm.stats().allocated_bytes, 0);
        vm.assert_consistent();
    }

    #[test]
    fn section_sized_mappings_keep_physical_phase() {
        let domain = make_domain();
        let vm = make_vm();
        // A 2 MiB buffer whose physical base is section-aligned: the chosen
        // IO virtual base must share the section phase so section granules
        // apply, which shows up as a section-sized unmap granule.
        let iova = vm
            .map(
                &domain,
                0,
                &one_chunk(0x9010_0000, 2 * SECTION_SIZE),
                0,
                2 * SECTION_SIZE,
                Prot::READ,
            )
            .unwrap();
        assert!(is_aligned(iova.0, SECTION_SIZE));
        assert_eq!(domain.unmap(iova, SECTION_SIZE), SECTION_SIZE);
        // Re-establish for a clean teardown through the manager.
        domain
            .map(iova, PhysicalAddress(0x9010_0000), SECTION_SIZE, Prot::READ)
            .unwrap();
        assert_eq!(vm.unmap(&domain, iova), 2 * SECTION_SIZE);
    }

    #[test]
    fn sub_page_offset_is_preserved() {
        let domain = make_domain();
        let vm = make_vm();
        let iova = vm
            .map(
                &domain,
                0,
                &one_chunk(0x8000_0000, 2 * PAGE_SIZE),
                0x234,
                PAGE_SIZE,
                Prot::READ,
            )
            .unwrap();
        assert_eq!(iova.0 & (PAGE_SIZE - 1), 0x234);
        assert_eq!(
            domain.iova_to_phys(iova),
            Some(PhysicalAddress(0x8000_0234))
        );
        assert_eq!(vm.unmap(&domain, iova), 2 * PAGE_SIZE);

        assert_eq!(
            vm.map(
                &domain,
                0,
                &one_chunk(0x8000_0000, PAGE_SIZE),
                PAGE_SIZE,
                PAGE_SIZE,
                Prot::READ,
            ),
            Err(IovmmError::InvalidArgument("offset must be smaller than a page"))
        );
    }

    #[test]
    fn failed_mapping_releases_everything() {
        // An allocator whose second-level budget runs out partway through
        // the scatter walk.
        struct Budgeted {
            inner: HeapTables,
            lv2_budget: usize,
        }
        impl TableAllocator for Budgeted {
            fn allocate_lv1(&mut self) -> Option<(NonNull<Lv1Table>, PhysicalAddress)> {
                self.inner.allocate_lv1()
            }
            unsafe fn deallocate_lv1(&mut self, table: NonNull<Lv1Table>, pa: PhysicalAddress) {
                unsafe { self.inner.deallocate_lv1(table, pa) }
            }
            fn allocate_lv2(&mut self) -> Option<(NonNull<Lv2Table>, PhysicalAddress)> {
                if self.lv2_budget == 0 {
                    return None;
                }
                self.lv2_budget -= 1;
                self.inner.allocate_lv2()
            }
            unsafe fn deallocate_lv2(&mut self, table: NonNull<Lv2Table>, pa: PhysicalAddress) {
                unsafe { self.inner.deallocate_lv2(table, pa) }
            }
            fn allocate_page(&mut self) -> Option<(NonNull<u8>, PhysicalAddress)> {
                self.inner.allocate_page()
            }
            unsafe fn deallocate_page(&mut self, page: NonNull<u8>, pa: PhysicalAddress) {
                unsafe { self.inner.deallocate_page(page, pa) }
            }
            fn lv2_table(&self, pa: PhysicalAddress) -> NonNull<Lv2Table> {
                self.inner.lv2_table(pa)
            }
        }

        // One table goes to the context's zero table and one to the first
        // first-level slot the mapping touches; the run then crosses into a
        // second slot whose table allocation fails.
        let ctx = SysMmu::new(Budgeted {
            inner: HeapTables::new(),
            lv2_budget: 2,
        })
        .unwrap();
        let domain = TranslationDomain::new(ctx, PageSizes::BASE, None).unwrap();
        let vm = make_vm();
        // 1 MiB + one page of small pages (the physical base is only
        // page-aligned, so no section granule can absorb the run).
        let size = SECTION_SIZE + PAGE_SIZE;
        let sg = one_chunk(0x8000_1000, size);
        let result = vm.map(&domain, 0, &sg, 0, size, Prot::READ);
        assert_eq!(
            result,
            Err(IovmmError::Map(crate::MapError::OutOfMemory(
                crate::AllocFailure
            )))
        );
        // No region survived and nothing is left mapped.
        assert_eq!(vm.stats().allocated_bytes, 0);
        assert_eq!(vm.find_region(IoVirtualAddress(PLANE_BASE)), None);
        assert_eq!(domain.iova_to_phys(IoVirtualAddress(PLANE_BASE)), None);
        vm.assert_consistent();
    }

    #[test]
    fn one_to_one_mappings_check_overlap() {
        let domain = make_domain();
        let vm = make_vm();
        // Below the plane window: no bitmap involvement.
        let fixed = vm
            .map_oto(&domain, PhysicalAddress(0x0c00_0000), 2 * PAGE_SIZE, Prot::READ)
            .unwrap();
        assert_eq!(fixed, IoVirtualAddress(0x0c00_0000));
        assert_eq!(
            domain.iova_to_phys(fixed + PAGE_SIZE),
            Some(PhysicalAddress(0x0c00_1000))
        );
        assert_eq!(
            vm.map_oto(&domain, PhysicalAddress(0x0c00_1000), PAGE_SIZE, Prot::READ),
            Err(IovmmError::Overlap(IoVirtualAddress(0x0c00_1000)))
        );
        assert_eq!(vm.unmap_oto(&domain, PhysicalAddress(0x0c00_0000)), 2 * PAGE_SIZE);
        assert_eq!(domain.iova_to_phys(fixed), None);

        // Inside the plane window the pages are reserved in the bitmap, so a
        // subsequent allocation cannot land on them.
        let inside = vm
            .map_oto(&domain, PhysicalAddress(PLANE_BASE), PAGE_SIZE, Prot::READ)
            .unwrap();
        let allocated = vm
            .map(&domain, 0, &one_chunk(0x8000_0000, PAGE_SIZE), 0, PAGE_SIZE, Prot::READ)
            .unwrap();
        assert_ne!(allocated.0, inside.0);
        vm.assert_consistent();
        assert_eq!(vm.unmap_oto(&domain, PhysicalAddress(PLANE_BASE)), PAGE_SIZE);
        assert_eq!(vm.unmap(&domain, allocated), PAGE_SIZE);
    }

    #[test]
    fn find_region_and_counters() {
        let domain = make_domain();
        let vm = make_vm();
        let iova = vm
            .map(&domain, 0, &one_chunk(0x8000_0000, LPAGE_SIZE), 0, LPAGE_SIZE, Prot::READ)
            .unwrap();
        assert_eq!(vm.find_region(iova + 0x5000), Some((iova, LPAGE_SIZE)));
        assert_eq!(vm.find_region(IoVirtualAddress(0x0)), None);
        assert_eq!(vm.stats().num_map, 1);
        assert_eq!(vm.stats().num_unmap, 0);

        // Unknown unmap is a safe no-op.
        assert_eq!(vm.unmap(&domain, IoVirtualAddress(0x2000_0000)), 0);
        assert_eq!(vm.unmap(&domain, iova), LPAGE_SIZE);
        let stats = vm.stats();
        assert_eq!((stats.num_map, stats.num_unmap), (1, 1));
    }

    #[test]
    fn huge_plane_hosts_supersection_runs() {
        let domain = make_domain();
        let vm = make_vm();
        let iova = vm
            .map(
                &domain,
                0,
                &one_chunk(0x4000_0000, SUPERSECTION_SIZE),
                0,
                SUPERSECTION_SIZE,
                Prot::READ,
            )
            .unwrap();
        // Both sides are 16 MiB aligned, so one super-section granule serves
        // the whole run.
        assert_eq!(domain.unmap(iova, SUPERSECTION_SIZE), SUPERSECTION_SIZE);
        domain
            .map(iova, PhysicalAddress(0x4000_0000), SUPERSECTION_SIZE, Prot::READ)
            .unwrap();
        assert_eq!(vm.unmap(&domain, iova), SUPERSECTION_SIZE);
    }

    #[test]
    fn display_reports_occupancy() {
        let domain = make_domain();
        let vm = make_vm();
        vm.map(&domain, 0, &one_chunk(0x8000_0000, PAGE_SIZE), 0, PAGE_SIZE, Prot::READ)
            .unwrap();
        let report = alloc::format!("{}", vm);
        assert!(report.contains("plane 0"));
        assert!(report.contains("1 regions"));
        assert!(report.contains("1 mappings, 0 unmappings"));
    }
}

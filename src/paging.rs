// Copyright 2025 The sysmmu Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! The two-level translation-table engine.
//!
//! A translation table maps a 32-bit IO virtual address space with a 4096-entry
//! first-level table (one entry per 1 MiB) and lazily-allocated 256-entry
//! second-level tables (one entry per 4 KiB). Both levels use 4-byte entries.
//! Entries are stored in [`AtomicU32`] cells and written with release ordering,
//! which stands in for the table-memory flush a hardware driver performs after
//! updating a live descriptor.
//!
//! An unmapped first-level entry is never a raw zero. It holds the *zero-link*
//! sentinel, a table link to the context's statically-allocated all-zero
//! second-level table, so that a translation unit speculatively walking the
//! table always reads a well-formed (always-faulting) descriptor.

use crate::{AllocFailure, MapError};
use bitflags::bitflags;
use core::fmt::{self, Debug, Display, Formatter};
use core::ops::{Add, Sub};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use log::warn;
use thiserror::Error;

pub const PAGE_SHIFT: usize = 12;
/// Small page size (4 KiB), the minimum translation granule.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Large page size (64 KiB), written as 16 replicated second-level entries.
pub const LPAGE_SIZE: usize = PAGE_SIZE << 4;
/// Section size (1 MiB), one first-level entry.
pub const SECTION_SIZE: usize = 1 << 20;
/// Super-section size (16 MiB), written as 16 replicated first-level entries.
pub const SUPERSECTION_SIZE: usize = SECTION_SIZE << 4;

/// Number of entries in a first-level table.
pub const NUM_LV1_ENTRIES: usize = 4096;
/// Number of entries in a second-level table.
pub const NUM_LV2_ENTRIES: usize = 256;
/// Byte size (and required alignment) of a first-level table.
pub const LV1_TABLE_SIZE: usize = NUM_LV1_ENTRIES * 4;
/// Byte size (and required alignment) of a second-level table.
pub const LV2_TABLE_SIZE: usize = NUM_LV2_ENTRIES * 4;

/// One past the highest translatable IO virtual address.
pub const IOVA_END: usize = 1 << 32;

/// One past the highest physical address representable in a 4-byte entry.
pub const PHYS_END: usize = 1 << 32;

const SPAGES_PER_LPAGE: usize = LPAGE_SIZE / PAGE_SIZE;

/// An IO virtual address, the input of a System MMU translation.
#[derive(Copy, Clone, Default, Eq, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct IoVirtualAddress(pub usize);

impl Display for IoVirtualAddress {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        write!(f, "{:#010x}", self.0)
    }
}

impl Debug for IoVirtualAddress {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        write!(f, "IoVirtualAddress({})", self)
    }
}

impl Sub for IoVirtualAddress {
    type Output = usize;

    fn sub(self, other: Self) -> Self::Output {
        self.0 - other.0
    }
}

impl Add<usize> for IoVirtualAddress {
    type Output = Self;

    fn add(self, other: usize) -> Self {
        Self(self.0 + other)
    }
}

impl Sub<usize> for IoVirtualAddress {
    type Output = Self;

    fn sub(self, other: usize) -> Self {
        Self(self.0 - other)
    }
}

/// A physical address, the output of a System MMU translation.
#[derive(Copy, Clone, Default, Eq, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct PhysicalAddress(pub usize);

impl Display for PhysicalAddress {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        write!(f, "{:#010x}", self.0)
    }
}

impl Debug for PhysicalAddress {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        write!(f, "PhysicalAddress({})", self)
    }
}

impl Sub for PhysicalAddress {
    type Output = usize;

    fn sub(self, other: Self) -> Self::Output {
        self.0 - other.0
    }
}

impl Add<usize> for PhysicalAddress {
    type Output = Self;

    fn add(self, other: usize) -> Self {
        Self(self.0 + other)
    }
}

impl Sub<usize> for PhysicalAddress {
    type Output = Self;

    fn sub(self, other: usize) -> Self {
        Self(self.0 - other)
    }
}

pub(crate) const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
    ((value - 1) | (alignment - 1)) + 1
}

pub(crate) const fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}

/// Index of the first-level entry covering `iova`.
pub const fn lv1_index(iova: IoVirtualAddress) -> usize {
    (iova.0 >> 20) & (NUM_LV1_ENTRIES - 1)
}

/// Index of the second-level entry covering `iova` within its table.
pub const fn lv2_index(iova: IoVirtualAddress) -> usize {
    (iova.0 >> PAGE_SHIFT) & (NUM_LV2_ENTRIES - 1)
}

bitflags! {
    /// Tag bits of a first-level entry.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Lv1Flags: u32 {
        const TYPE_TABLE   = 0b01;
        const TYPE_SECTION = 0b10;
        /// With `TYPE_SECTION`: a 16 MiB super-section.
        const SUPER        = 1 << 18;
        /// With `TYPE_SECTION`: a large section (size fixed by the hardware
        /// generation).
        const LARGE        = 1 << 19;
    }
}

bitflags! {
    /// Tag bits of a second-level entry.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Lv2Flags: u32 {
        const TYPE_LARGE = 0b01;
        const TYPE_SMALL = 0b10;
    }
}

bitflags! {
    /// Access protection requested for a mapping.
    ///
    /// Protection is not encoded in translation entries on this hardware
    /// family; it selects prefetch direction and fault reporting detail.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct Prot: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
    }
}

const LV1_TYPE_MASK: u32 = 0b11;
const LV1_TABLE_ADDR_MASK: u32 = !(LV2_TABLE_SIZE as u32 - 1);
const SECTION_ADDR_MASK: u32 = !(SECTION_SIZE as u32 - 1);
const SUPERSECTION_ADDR_MASK: u32 = !(SUPERSECTION_SIZE as u32 - 1);
const SPAGE_ADDR_MASK: u32 = !(PAGE_SIZE as u32 - 1);
const LPAGE_ADDR_MASK: u32 = !(LPAGE_SIZE as u32 - 1);

/// Classification of a first-level entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryKind {
    Fault,
    PageTableLink,
    Section,
    LargeSection,
    SuperSection,
}

/// Classification of a second-level entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Lv2Kind {
    Fault,
    SmallPage,
    LargePage,
}

/// A first-level entry.
///
/// Loads use acquire and stores use release ordering so that a table walk
/// never observes a link to a second-level table before the table contents.
#[repr(C)]
pub struct Lv1Entry(AtomicU32);

impl Lv1Entry {
    pub(crate) fn bits(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, raw: u32) {
        self.0.store(raw, Ordering::Release);
    }

    pub(crate) fn raw_table_link(table: PhysicalAddress) -> u32 {
        (table.0 as u32 & LV1_TABLE_ADDR_MASK) | Lv1Flags::TYPE_TABLE.bits()
    }

    fn raw_section(pa: PhysicalAddress) -> u32 {
        (pa.0 as u32 & SECTION_ADDR_MASK) | Lv1Flags::TYPE_SECTION.bits()
    }

    fn raw_large_section(pa: PhysicalAddress, size: usize) -> u32 {
        (pa.0 as u32 & !(size as u32 - 1)) | (Lv1Flags::TYPE_SECTION | Lv1Flags::LARGE).bits()
    }

    fn raw_supersection(pa: PhysicalAddress) -> u32 {
        (pa.0 as u32 & SUPERSECTION_ADDR_MASK) | (Lv1Flags::TYPE_SECTION | Lv1Flags::SUPER).bits()
    }

    /// Classifies this entry. `zero_link` is the context's Fault sentinel; it
    /// is the only table-link value that classifies as `Fault`.
    pub fn classify(&self, zero_link: u32) -> EntryKind {
        let bits = self.bits();
        if bits == zero_link {
            return EntryKind::Fault;
        }
        match bits & LV1_TYPE_MASK {
            0b01 => EntryKind::PageTableLink,
            0b10 => {
                let flags = Lv1Flags::from_bits_retain(bits);
                if flags.contains(Lv1Flags::SUPER) {
                    EntryKind::SuperSection
                } else if flags.contains(Lv1Flags::LARGE) {
                    EntryKind::LargeSection
                } else {
                    EntryKind::Section
                }
            }
            // Raw zero and the reserved tag are never written by this crate;
            // a live table always holds the sentinel instead.
            _ => EntryKind::Fault,
        }
    }

    /// Returns the second-level table address of a `PageTableLink` entry.
    pub fn table_address(&self) -> PhysicalAddress {
        PhysicalAddress((self.bits() & LV1_TABLE_ADDR_MASK) as usize)
    }
}

impl Debug for Lv1Entry {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        write!(f, "{:#010x}", self.bits())
    }
}

/// A second-level entry. A raw zero is the Fault encoding at this level.
#[repr(C)]
pub struct Lv2Entry(AtomicU32);

impl Lv2Entry {
    pub(crate) fn bits(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, raw: u32) {
        self.0.store(raw, Ordering::Release);
    }

    fn raw_small(pa: PhysicalAddress) -> u32 {
        (pa.0 as u32 & SPAGE_ADDR_MASK) | Lv2Flags::TYPE_SMALL.bits()
    }

    fn raw_large(pa: PhysicalAddress) -> u32 {
        (pa.0 as u32 & LPAGE_ADDR_MASK) | Lv2Flags::TYPE_LARGE.bits()
    }

    pub fn classify(&self) -> Lv2Kind {
        let bits = self.bits();
        if bits & Lv2Flags::TYPE_SMALL.bits() != 0 {
            Lv2Kind::SmallPage
        } else if bits & Lv2Flags::TYPE_LARGE.bits() != 0 {
            Lv2Kind::LargePage
        } else {
            Lv2Kind::Fault
        }
    }
}

impl Debug for Lv2Entry {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        write!(f, "{:#010x}", self.bits())
    }
}

/// A first-level translation table: 4096 entries, 16 KiB, 16 KiB-aligned.
#[repr(C, align(16384))]
pub struct Lv1Table {
    entries: [Lv1Entry; NUM_LV1_ENTRIES],
}

impl Lv1Table {
    pub fn entry(&self, index: usize) -> &Lv1Entry {
        &self.entries[index]
    }
}

/// A second-level translation table: 256 entries, 1 KiB, 1 KiB-aligned.
#[repr(C, align(1024))]
pub struct Lv2Table {
    entries: [Lv2Entry; NUM_LV2_ENTRIES],
}

impl Lv2Table {
    pub fn entry(&self, index: usize) -> &Lv2Entry {
        &self.entries[index]
    }
}

/// Supplies table memory to the engine and converts the physical addresses
/// stored in entries back into pointers the engine can walk.
///
/// Second-level allocation happens on the map path with a translation-table
/// lock held, so implementations must not block; a failed allocation is
/// reported as `None` and surfaces to the mapping caller as
/// [`MapError::OutOfMemory`].
pub trait TableAllocator {
    /// Allocates a zeroed, suitably-aligned first-level table.
    fn allocate_lv1(&mut self) -> Option<(NonNull<Lv1Table>, PhysicalAddress)>;

    /// Deallocates a first-level table.
    ///
    /// # Safety
    ///
    /// `table` must have been returned by [`allocate_lv1`](Self::allocate_lv1)
    /// on this allocator and not yet deallocated.
    unsafe fn deallocate_lv1(&mut self, table: NonNull<Lv1Table>, pa: PhysicalAddress);

    /// Allocates a zeroed second-level table from the fixed-size slab.
    fn allocate_lv2(&mut self) -> Option<(NonNull<Lv2Table>, PhysicalAddress)>;

    /// Returns a second-level table to the slab.
    ///
    /// # Safety
    ///
    /// `table` must have been returned by [`allocate_lv2`](Self::allocate_lv2)
    /// on this allocator and not yet deallocated.
    unsafe fn deallocate_lv2(&mut self, table: NonNull<Lv2Table>, pa: PhysicalAddress);

    /// Allocates a zeroed data page (used for the static fault page).
    fn allocate_page(&mut self) -> Option<(NonNull<u8>, PhysicalAddress)>;

    /// Deallocates a data page.
    ///
    /// # Safety
    ///
    /// `page` must have been returned by [`allocate_page`](Self::allocate_page)
    /// on this allocator and not yet deallocated.
    unsafe fn deallocate_page(&mut self, page: NonNull<u8>, pa: PhysicalAddress);

    /// Converts a second-level table address read out of a first-level entry
    /// back into a pointer.
    ///
    /// Panics if `pa` was not produced by this allocator; the engine only
    /// passes addresses it previously installed.
    fn lv2_table(&self, pa: PhysicalAddress) -> NonNull<Lv2Table>;
}

/// Mapping granules available to a translation domain.
///
/// 4 KiB, 64 KiB, 1 MiB and 16 MiB are always available; the large section
/// (2 or 8 MiB) exists only on some hardware generations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageSizes {
    pub large_section: Option<usize>,
}

impl PageSizes {
    pub const BASE: Self = Self {
        large_section: None,
    };

    /// Bitmask of supported granule sizes, one bit per size.
    pub fn bitmap(&self) -> usize {
        PAGE_SIZE
            | LPAGE_SIZE
            | SECTION_SIZE
            | SUPERSECTION_SIZE
            | self.large_section.unwrap_or(0)
    }
}

/// Failed `unmap` outcomes. These indicate caller bugs (unmapping something
/// that is not mapped, or with a size smaller than the installed granule) and
/// are reported as an unmapped size of zero at the domain surface.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum UnmapError {
    #[error("no mapping at {0}")]
    NotMapped(IoVirtualAddress),
    #[error(
        "mapping at {iova} is a {granule:#x}-byte granule but only {requested:#x} bytes were requested"
    )]
    GranuleMismatch {
        iova: IoVirtualAddress,
        granule: usize,
        requested: usize,
    },
}

/// The translation tables of one domain: the first-level table, the parallel
/// free-slot counters for its second-level tables, and the granule set.
///
/// All mutation happens under the owning domain's page-table lock; the entry
/// cells themselves are atomics only so that a concurrent hardware walk of a
/// live table is well-defined.
pub struct Pagetable {
    lv1: NonNull<Lv1Table>,
    lv1_phys: PhysicalAddress,
    /// Free second-level slots under each first-level entry. 256 for an empty
    /// linked table, 0 for sections and sentinel entries.
    entcnt: alloc::boxed::Box<[u16; NUM_LV1_ENTRIES]>,
    zero_link: u32,
    page_sizes: PageSizes,
    released: bool,
}

// SAFETY: the table memory is exclusively owned by this value and only
// reachable through it; `&self` access goes through atomic entry cells.
unsafe impl Send for Pagetable {}

impl Pagetable {
    /// Allocates a first-level table with every entry initialised to the
    /// Fault sentinel `zero_link`.
    pub fn new<A: TableAllocator>(
        allocator: &mut A,
        zero_link: u32,
        page_sizes: PageSizes,
    ) -> Result<Self, AllocFailure> {
        let (lv1, lv1_phys) = allocator.allocate_lv1().ok_or(AllocFailure)?;
        let table = Self {
            lv1,
            lv1_phys,
            entcnt: alloc::boxed::Box::new([0; NUM_LV1_ENTRIES]),
            zero_link,
            page_sizes,
            released: false,
        };
        for index in 0..NUM_LV1_ENTRIES {
            table.lv1().entry(index).set(zero_link);
        }
        Ok(table)
    }

    fn lv1(&self) -> &Lv1Table {
        // SAFETY: `lv1` is valid until `release`, after which no method is
        // called (enforced by the owning domain).
        unsafe { self.lv1.as_ref() }
    }

    /// Physical address of the first-level table, programmed into controllers
    /// at attach time.
    pub fn root_address(&self) -> PhysicalAddress {
        self.lv1_phys
    }

    pub fn page_sizes(&self) -> PageSizes {
        self.page_sizes
    }

    /// Free second-level slots recorded under the first-level entry covering
    /// `iova`.
    pub fn free_slots(&self, iova: IoVirtualAddress) -> u16 {
        self.entcnt[lv1_index(iova)]
    }

    /// Returns the second-level table covering `iova`, allocating and linking
    /// a fresh one if the first-level entry is currently Fault.
    ///
    /// On a Fault-to-link transition `on_lv1_change` is invoked with `iova`
    /// before this function returns; the caller broadcasts an FLPD-cache
    /// invalidation to every attached controller from it, so the stale cached
    /// sentinel is gone before the mapping operation completes.
    pub fn second_level<A: TableAllocator>(
        &mut self,
        allocator: &mut A,
        iova: IoVirtualAddress,
        on_lv1_change: &mut dyn FnMut(IoVirtualAddress),
    ) -> Result<NonNull<Lv2Table>, MapError> {
        let index = lv1_index(iova);
        let entry = self.lv1().entry(index);
        match entry.classify(self.zero_link) {
            EntryKind::Fault => {
                let (table, pa) = allocator.allocate_lv2().ok_or(AllocFailure)?;
                entry.set(Lv1Entry::raw_table_link(pa));
                self.entcnt[index] = NUM_LV2_ENTRIES as u16;
                on_lv1_change(iova);
                Ok(table)
            }
            EntryKind::PageTableLink => Ok(allocator.lv2_table(entry.table_address())),
            _ => Err(MapError::AddressInUse(iova)),
        }
    }

    /// Installs a small (4 KiB) or large (64 KiB) page mapping.
    ///
    /// `iova` and `pa` must be aligned to `size`. If any target second-level
    /// entry is already in use, the entries written by this call are unwound
    /// to Fault before the error returns.
    pub fn install_pages<A: TableAllocator>(
        &mut self,
        allocator: &mut A,
        iova: IoVirtualAddress,
        pa: PhysicalAddress,
        size: usize,
        on_lv1_change: &mut dyn FnMut(IoVirtualAddress),
    ) -> Result<(), MapError> {
        debug_assert!(size == PAGE_SIZE || size == LPAGE_SIZE);
        let table = self.second_level(allocator, iova, on_lv1_change)?;
        // SAFETY: the allocator returned a valid table pointer and the engine
        // has exclusive ownership of it.
        let table = unsafe { table.as_ref() };
        let index = lv1_index(iova);
        let start = lv2_index(iova);
        if size == PAGE_SIZE {
            let entry = table.entry(start);
            if entry.classify() != Lv2Kind::Fault {
                return Err(MapError::AddressInUse(iova));
            }
            entry.set(Lv2Entry::raw_small(pa));
            self.entcnt[index] -= 1;
        } else {
            for i in 0..SPAGES_PER_LPAGE {
                let entry = table.entry(start + i);
                if entry.classify() != Lv2Kind::Fault {
                    for j in 0..i {
                        table.entry(start + j).set(0);
                    }
                    return Err(MapError::AddressInUse(iova));
                }
                entry.set(Lv2Entry::raw_large(pa));
            }
            self.entcnt[index] -= SPAGES_PER_LPAGE as u16;
        }
        Ok(())
    }

    /// Installs a section-family mapping (1 MiB section, generation-dependent
    /// large section, or 16 MiB super-section).
    ///
    /// Each covered first-level entry must be Fault or an entirely-unused
    /// second-level link; an unused link's table is returned to the slab. On a
    /// conflict partway through a multi-entry span, entries already written by
    /// this call are unwound to Fault before the error returns.
    pub fn install_sections<A: TableAllocator>(
        &mut self,
        allocator: &mut A,
        iova: IoVirtualAddress,
        pa: PhysicalAddress,
        size: usize,
        on_lv1_change: &mut dyn FnMut(IoVirtualAddress),
    ) -> Result<(), MapError> {
        let raw = match size {
            SECTION_SIZE => Lv1Entry::raw_section(pa),
            SUPERSECTION_SIZE => Lv1Entry::raw_supersection(pa),
            _ => {
                debug_assert_eq!(Some(size), self.page_sizes.large_section);
                Lv1Entry::raw_large_section(pa, size)
            }
        };
        let base = lv1_index(iova);
        let span = size / SECTION_SIZE;
        for k in 0..span {
            let index = base + k;
            let ok = match self.lv1().entry(index).classify(self.zero_link) {
                EntryKind::Fault => true,
                EntryKind::PageTableLink => {
                    if usize::from(self.entcnt[index]) == NUM_LV2_ENTRIES {
                        let table_pa = self.lv1().entry(index).table_address();
                        let table = allocator.lv2_table(table_pa);
                        // SAFETY: the link was installed by this engine from
                        // an `allocate_lv2` result and is fully unused.
                        unsafe { allocator.deallocate_lv2(table, table_pa) };
                        self.entcnt[index] = 0;
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if !ok {
                for j in 0..k {
                    self.lv1().entry(base + j).set(self.zero_link);
                }
                return Err(MapError::AddressInUse(IoVirtualAddress(
                    iova.0 + k * SECTION_SIZE,
                )));
            }
            self.lv1().entry(index).set(raw);
            self.entcnt[index] = 0;
            on_lv1_change(IoVirtualAddress(iova.0 + k * SECTION_SIZE));
        }
        Ok(())
    }

    /// Maps `[iova, iova + size)` to `[pa, pa + size)` using the largest
    /// granules alignment permits.
    ///
    /// `iova`, `pa` and `size` must be page-aligned. On a failure partway
    /// through, everything this call installed is unmapped again before the
    /// error returns; no partial mapping is observable.
    pub fn map_range<A: TableAllocator>(
        &mut self,
        allocator: &mut A,
        iova: IoVirtualAddress,
        pa: PhysicalAddress,
        size: usize,
        _prot: Prot,
        on_lv1_change: &mut dyn FnMut(IoVirtualAddress),
    ) -> Result<(), MapError> {
        if size == 0 || !is_aligned(iova.0 | pa.0 | size, PAGE_SIZE) {
            return Err(MapError::InvalidSize { iova, size });
        }
        if iova.0 + size > IOVA_END {
            return Err(MapError::AddressRange(iova + size));
        }
        if pa.0 + size > PHYS_END {
            return Err(MapError::PhysicalRange(pa + size));
        }

        let mut mapped = 0;
        while mapped < size {
            let cur_iova = iova + mapped;
            let cur_pa = pa + mapped;
            let granule = self.best_granule(cur_iova, cur_pa, size - mapped);
            let result = if granule >= SECTION_SIZE {
                self.install_sections(allocator, cur_iova, cur_pa, granule, on_lv1_change)
            } else {
                self.install_pages(allocator, cur_iova, cur_pa, granule, on_lv1_change)
            };
            if let Err(e) = result {
                self.rollback(allocator, iova, mapped);
                return Err(e);
            }
            mapped += granule;
        }
        Ok(())
    }

    fn best_granule(&self, iova: IoVirtualAddress, pa: PhysicalAddress, remaining: usize) -> usize {
        let candidates = [
            SUPERSECTION_SIZE,
            self.page_sizes.large_section.unwrap_or(0),
            SECTION_SIZE,
            LPAGE_SIZE,
        ];
        for &granule in &candidates {
            if granule != 0 && remaining >= granule && is_aligned(iova.0 | pa.0, granule) {
                return granule;
            }
        }
        PAGE_SIZE
    }

    /// Unmaps the granules installed by an aborted `map_range` call.
    fn rollback<A: TableAllocator>(
        &mut self,
        allocator: &mut A,
        iova: IoVirtualAddress,
        installed: usize,
    ) {
        let mut undone = 0;
        while undone < installed {
            match self.unmap_at(allocator, iova + undone, installed - undone) {
                Ok(granule) => undone += granule,
                Err(e) => {
                    // A granule this call just installed cannot fail to unmap.
                    warn!("map rollback at {}: {}", iova + undone, e);
                    break;
                }
            }
        }
    }

    /// Clears the granule actually installed at `iova` and returns its size.
    ///
    /// The granule may be larger than `requested`; that is a caller
    /// bookkeeping bug and is refused without touching the table.
    pub fn unmap_at<A: TableAllocator>(
        &mut self,
        allocator: &A,
        iova: IoVirtualAddress,
        requested: usize,
    ) -> Result<usize, UnmapError> {
        let index = lv1_index(iova);
        let entry = self.lv1().entry(index);
        match entry.classify(self.zero_link) {
            EntryKind::Fault => Err(UnmapError::NotMapped(iova)),
            EntryKind::Section => self.clear_sections(iova, SECTION_SIZE, requested),
            EntryKind::LargeSection => {
                let size = self
                    .page_sizes
                    .large_section
                    .expect("large-section entry on a generation without large sections");
                self.clear_sections(iova, size, requested)
            }
            EntryKind::SuperSection => self.clear_sections(iova, SUPERSECTION_SIZE, requested),
            EntryKind::PageTableLink => {
                let table = allocator.lv2_table(entry.table_address());
                // SAFETY: the link was installed by this engine and the table
                // stays allocated until `release`.
                let table = unsafe { table.as_ref() };
                let slot = table.entry(lv2_index(iova));
                match slot.classify() {
                    Lv2Kind::Fault => Err(UnmapError::NotMapped(iova)),
                    Lv2Kind::SmallPage => {
                        slot.set(0);
                        self.entcnt[index] += 1;
                        Ok(PAGE_SIZE)
                    }
                    Lv2Kind::LargePage => {
                        if requested < LPAGE_SIZE {
                            warn!(
                                "unmap of {:#x} bytes at {} hits a large page",
                                requested, iova
                            );
                            return Err(UnmapError::GranuleMismatch {
                                iova,
                                granule: LPAGE_SIZE,
                                requested,
                            });
                        }
                        let start = lv2_index(iova) & !(SPAGES_PER_LPAGE - 1);
                        for i in 0..SPAGES_PER_LPAGE {
                            table.entry(start + i).set(0);
                        }
                        self.entcnt[index] += SPAGES_PER_LPAGE as u16;
                        Ok(LPAGE_SIZE)
                    }
                }
            }
        }
    }

    fn clear_sections(
        &mut self,
        iova: IoVirtualAddress,
        granule: usize,
        requested: usize,
    ) -> Result<usize, UnmapError> {
        if requested < granule {
            warn!(
                "unmap of {:#x} bytes at {} hits a {:#x}-byte section granule",
                requested, iova, granule
            );
            return Err(UnmapError::GranuleMismatch {
                iova,
                granule,
                requested,
            });
        }
        let base = lv1_index(IoVirtualAddress(align_down(iova.0, granule)));
        for k in 0..granule / SECTION_SIZE {
            self.lv1().entry(base + k).set(self.zero_link);
        }
        Ok(granule)
    }

    /// Walks the tables and returns the physical address `iova` translates
    /// to, or `None` if either level faults.
    pub fn translate<A: TableAllocator>(
        &self,
        allocator: &A,
        iova: IoVirtualAddress,
    ) -> Option<PhysicalAddress> {
        let entry = self.lv1().entry(lv1_index(iova));
        match entry.classify(self.zero_link) {
            EntryKind::Fault => None,
            EntryKind::Section => Some(PhysicalAddress(
                (entry.bits() & SECTION_ADDR_MASK) as usize | (iova.0 & (SECTION_SIZE - 1)),
            )),
            EntryKind::LargeSection => {
                let size = self.page_sizes.large_section?;
                Some(PhysicalAddress(
                    (entry.bits() as usize & !(size - 1)) | (iova.0 & (size - 1)),
                ))
            }
            EntryKind::SuperSection => Some(PhysicalAddress(
                (entry.bits() & SUPERSECTION_ADDR_MASK) as usize
                    | (iova.0 & (SUPERSECTION_SIZE - 1)),
            )),
            EntryKind::PageTableLink => {
                let table = allocator.lv2_table(entry.table_address());
                // SAFETY: the link was installed by this engine and the table
                // stays allocated until `release`.
                let table = unsafe { table.as_ref() };
                let slot = table.entry(lv2_index(iova));
                match slot.classify() {
                    Lv2Kind::Fault => None,
                    Lv2Kind::SmallPage => Some(PhysicalAddress(
                        (slot.bits() & SPAGE_ADDR_MASK) as usize | (iova.0 & (PAGE_SIZE - 1)),
                    )),
                    Lv2Kind::LargePage => Some(PhysicalAddress(
                        (slot.bits() & LPAGE_ADDR_MASK) as usize | (iova.0 & (LPAGE_SIZE - 1)),
                    )),
                }
            }
        }
    }

    /// Raw first-level and (if linked) second-level entry bits around `iova`,
    /// for fault diagnostics.
    pub fn entry_snapshot<A: TableAllocator>(
        &self,
        allocator: &A,
        iova: IoVirtualAddress,
    ) -> (u32, Option<u32>) {
        let entry = self.lv1().entry(lv1_index(iova));
        let lv2 = if entry.classify(self.zero_link) == EntryKind::PageTableLink {
            let table = allocator.lv2_table(entry.table_address());
            // SAFETY: as in `translate`.
            let table = unsafe { table.as_ref() };
            Some(table.entry(lv2_index(iova)).bits())
        } else {
            None
        };
        (entry.bits(), lv2)
    }

    /// Frees every linked second-level table and the first-level table
    /// itself. Must be called exactly once before drop; the owning domain
    /// does so on destruction.
    pub fn release<A: TableAllocator>(&mut self, allocator: &mut A) {
        if self.released {
            return;
        }
        for index in 0..NUM_LV1_ENTRIES {
            let entry = self.lv1().entry(index);
            if entry.classify(self.zero_link) == EntryKind::PageTableLink {
                let pa = entry.table_address();
                let table = allocator.lv2_table(pa);
                // SAFETY: every link in the table came from `allocate_lv2`.
                unsafe { allocator.deallocate_lv2(table, pa) };
                entry.set(self.zero_link);
            }
        }
        // SAFETY: `lv1` came from `allocate_lv1` and no entry references
        // remain once the loop above has run.
        unsafe { allocator.deallocate_lv1(self.lv1, self.lv1_phys) };
        self.released = true;
    }
}

impl Drop for Pagetable {
    fn drop(&mut self) {
        debug_assert!(self.released, "Pagetable dropped without release()");
    }
}

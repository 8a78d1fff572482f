// Copyright 2025 The sysmmu Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! A library to manage System MMU (IOMMU) translation tables and IO virtual
//! address spaces.
//!
//! A System MMU translates the 32-bit IO virtual addresses used by DMA
//! masters through a two-level table: a 4096-entry first level (1 MiB per
//! entry) and lazily-allocated 256-entry second levels (4 KiB per entry).
//! This crate provides:
//!
//!   - the translation-table engine ([`paging`]),
//!   - translation domains implementing the generic IOMMU operations
//!     ([`domain`]),
//!   - per-device controller instances with activation reference counting and
//!     runtime power gating ([`controller`]),
//!   - the abstract controller register interface with per-generation
//!     capability sets ([`control`]),
//!   - fault decode, recovery and escalation ([`fault`]),
//!   - an IO virtual memory manager handing out address ranges above the
//!     engine ([`iovmm`]).
//!
//! Hardware access is abstracted behind traits: table memory comes from a
//! [`TableAllocator`](paging::TableAllocator), register access goes through
//! [`RegisterIo`](control::RegisterIo), and gate clocks through
//! [`GateClock`](controller::GateClock). [`HeapTables`] is a hosted
//! identity-bookkeeping allocator suitable for tests and simulation.
//!
//! Lock ordering, outermost first: domain page-table lock, context allocator
//! lock, domain owner-list lock, per-owner lock, per-controller-instance
//! lock. No path acquires them in any other order, and nothing blocks while
//! holding one. The IO virtual memory manager's lock is independent and is
//! never held across a call into a domain.
//!
//! # Example
//!
//! ```
//! use sysmmu::control::Generation;
//! use sysmmu::domain::{IommuOps, TranslationDomain};
//! use sysmmu::{HeapTables, IoVirtualAddress, PhysicalAddress, Prot, SysMmu};
//!
//! let ctx = SysMmu::new(HeapTables::new()).unwrap();
//! let domain = TranslationDomain::new(
//!     ctx,
//!     Generation::V5.capabilities().page_sizes,
//!     None,
//! )
//! .unwrap();
//! // Map a 1 MiB section and translate through it.
//! domain
//!     .map(
//!         IoVirtualAddress(0x8020_0000),
//!         PhysicalAddress(0x4000_0000),
//!         0x10_0000,
//!         Prot::READ | Prot::WRITE,
//!     )
//!     .unwrap();
//! assert_eq!(
//!     domain.iova_to_phys(IoVirtualAddress(0x8020_0500)),
//!     Some(PhysicalAddress(0x4000_0500)),
//! );
//! ```

#![no_std]

extern crate alloc;

pub mod control;
pub mod controller;
pub mod domain;
pub mod fault;
pub mod iovmm;
pub mod paging;

pub use paging::{IoVirtualAddress, PhysicalAddress, Prot};

use crate::paging::{
    Lv1Entry, Lv1Table, Lv2Table, TableAllocator, LV1_TABLE_SIZE, LV2_TABLE_SIZE, PAGE_SIZE,
};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;
use spin::Mutex;
use thiserror::Error;

/// Failure to allocate a translation table or backing page.
///
/// Second-level allocation runs with a page-table lock held and must not
/// block, so exhaustion is reported synchronously and the caller may retry.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("translation-table allocation failed")]
pub struct AllocFailure;

/// Errors returned by mapping operations.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum MapError {
    /// The target range is already mapped and was not unmapped first. Always
    /// a caller bug, never retried.
    #[error("address {0} is already mapped")]
    AddressInUse(IoVirtualAddress),
    /// Table allocation failed; the request may be retried later.
    #[error(transparent)]
    OutOfMemory(#[from] AllocFailure),
    /// The IO virtual range ends beyond the translatable address space.
    #[error("IO virtual range ends at {0}, beyond the translatable space")]
    AddressRange(IoVirtualAddress),
    /// The physical range does not fit a 4-byte table entry.
    #[error("physical range ends at {0}, beyond what an entry can encode")]
    PhysicalRange(PhysicalAddress),
    /// Address or size is not page-aligned, or the size is zero.
    #[error("invalid mapping request at {iova} of {size:#x} bytes")]
    InvalidSize { iova: IoVirtualAddress, size: usize },
}

/// Process-wide System MMU context.
///
/// Owns the singletons every domain and controller shares: the statically
/// all-zero second-level table targeted by the first-level Fault sentinel,
/// the zeroed physical page that fault recovery maps at faulting addresses,
/// and the table allocator. Created once at subsystem initialisation and
/// passed by handle to everything else; the singletons are written only here
/// and read-only afterwards.
pub struct SysMmu<A: TableAllocator> {
    allocator: Mutex<A>,
    zero_lv2: NonNull<Lv2Table>,
    zero_lv2_phys: PhysicalAddress,
    fault_page: NonNull<u8>,
    fault_page_phys: PhysicalAddress,
}

// SAFETY: the raw table/page pointers are written only during `new` and the
// memory they reference is never mutated afterwards; the allocator is behind
// a lock.
unsafe impl<A: TableAllocator + Send> Send for SysMmu<A> {}
unsafe impl<A: TableAllocator + Send> Sync for SysMmu<A> {}

impl<A: TableAllocator> SysMmu<A> {
    /// Initialises the subsystem context over the given table allocator.
    pub fn new(mut allocator: A) -> Result<Arc<Self>, AllocFailure> {
        let (zero_lv2, zero_lv2_phys) = allocator.allocate_lv2().ok_or(AllocFailure)?;
        let (fault_page, fault_page_phys) = match allocator.allocate_page() {
            Some(page) => page,
            None => {
                // SAFETY: allocated from this allocator just above.
                unsafe { allocator.deallocate_lv2(zero_lv2, zero_lv2_phys) };
                return Err(AllocFailure);
            }
        };
        Ok(Arc::new(Self {
            allocator: Mutex::new(allocator),
            zero_lv2,
            zero_lv2_phys,
            fault_page,
            fault_page_phys,
        }))
    }

    /// The table allocator. Held only for the duration of a single engine
    /// call, after the page-table lock.
    pub fn allocator(&self) -> &Mutex<A> {
        &self.allocator
    }

    /// The first-level Fault sentinel: a table link to the context's all-zero
    /// second-level table. Never a raw zero, so speculative hardware walks of
    /// an unmapped slot stay well-defined.
    pub fn zero_link(&self) -> u32 {
        Lv1Entry::raw_table_link(self.zero_lv2_phys)
    }

    /// Physical address of the all-zero page that fault recovery installs at
    /// faulting addresses.
    pub fn fault_page(&self) -> PhysicalAddress {
        self.fault_page_phys
    }
}

impl<A: TableAllocator> Drop for SysMmu<A> {
    fn drop(&mut self) {
        let allocator = self.allocator.get_mut();
        // SAFETY: both singletons were allocated from this allocator in `new`
        // and nothing references them once the context is dropped.
        unsafe {
            allocator.deallocate_lv2(self.zero_lv2, self.zero_lv2_phys);
            allocator.deallocate_page(self.fault_page, self.fault_page_phys);
        }
    }
}

// Synthetic physical windows handed out by `HeapTables`. Only their mutual
// disjointness matters; they are bookkeeping indices, not real addresses.
const LV1_PHYS_BASE: usize = 0x0100_0000;
const LV2_PHYS_BASE: usize = 0x0500_0000;
const PAGE_PHYS_BASE: usize = 0x0900_0000;

/// A hosted [`TableAllocator`] backed by the global allocator.
///
/// Tables are allocated one object at a time at their natural alignment
/// (16 KiB first level, 1 KiB second level) and assigned synthetic physical
/// addresses from per-kind windows; freed slots are reused first, so the
/// second-level pool behaves like a fixed-size slab. The synthetic addresses
/// fit the 4-byte entry format regardless of host pointer width.
pub struct HeapTables {
    lv1: Vec<Option<NonNull<Lv1Table>>>,
    lv2: Vec<Option<NonNull<Lv2Table>>>,
    pages: Vec<Option<NonNull<u8>>>,
}

// SAFETY: the pointers are uniquely owned allocations; `HeapTables` only
// hands each one out once between allocate and deallocate.
unsafe impl Send for HeapTables {}

impl HeapTables {
    pub fn new() -> Self {
        Self {
            lv1: Vec::new(),
            lv2: Vec::new(),
            pages: Vec::new(),
        }
    }

    fn claim_slot<T>(slots: &mut Vec<Option<NonNull<T>>>, value: NonNull<T>) -> usize {
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(value);
                return index;
            }
        }
        slots.push(Some(value));
        slots.len() - 1
    }

    fn alloc_zeroed<T>(size: usize) -> Option<NonNull<T>> {
        let layout = Layout::from_size_align(size, size).unwrap();
        // SAFETY: `layout` has a non-zero size.
        NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) }).map(|page| page.cast())
    }

    /// # Safety
    ///
    /// `ptr` must have been produced by `alloc_zeroed` with the same `size`.
    unsafe fn dealloc<T>(ptr: NonNull<T>, size: usize) {
        let layout = Layout::from_size_align(size, size).unwrap();
        // SAFETY: per the caller's contract.
        unsafe { alloc::alloc::dealloc(ptr.as_ptr().cast(), layout) };
    }
}

impl Default for HeapTables {
    fn default() -> Self {
        Self::new()
    }
}

impl TableAllocator for HeapTables {
    fn allocate_lv1(&mut self) -> Option<(NonNull<Lv1Table>, PhysicalAddress)> {
        let table = Self::alloc_zeroed::<Lv1Table>(LV1_TABLE_SIZE)?;
        let index = Self::claim_slot(&mut self.lv1, table);
        Some((table, PhysicalAddress(LV1_PHYS_BASE + index * LV1_TABLE_SIZE)))
    }

    unsafe fn deallocate_lv1(&mut self, table: NonNull<Lv1Table>, pa: PhysicalAddress) {
        self.lv1[(pa.0 - LV1_PHYS_BASE) / LV1_TABLE_SIZE] = None;
        // SAFETY: allocated by `allocate_lv1` with this size.
        unsafe { Self::dealloc(table, LV1_TABLE_SIZE) };
    }

    fn allocate_lv2(&mut self) -> Option<(NonNull<Lv2Table>, PhysicalAddress)> {
        let table = Self::alloc_zeroed::<Lv2Table>(LV2_TABLE_SIZE)?;
        let index = Self::claim_slot(&mut self.lv2, table);
        Some((table, PhysicalAddress(LV2_PHYS_BASE + index * LV2_TABLE_SIZE)))
    }

    unsafe fn deallocate_lv2(&mut self, table: NonNull<Lv2Table>, pa: PhysicalAddress) {
        self.lv2[(pa.0 - LV2_PHYS_BASE) / LV2_TABLE_SIZE] = None;
        // SAFETY: allocated by `allocate_lv2` with this size.
        unsafe { Self::dealloc(table, LV2_TABLE_SIZE) };
    }

    fn allocate_page(&mut self) -> Option<(NonNull<u8>, PhysicalAddress)> {
        let page = Self::alloc_zeroed::<u8>(PAGE_SIZE)?;
        let index = Self::claim_slot(&mut self.pages, page);
        Some((page, PhysicalAddress(PAGE_PHYS_BASE + index * PAGE_SIZE)))
    }

    unsafe fn deallocate_page(&mut self, page: NonNull<u8>, pa: PhysicalAddress) {
        self.pages[(pa.0 - PAGE_PHYS_BASE) / PAGE_SIZE] = None;
        // SAFETY: allocated by `allocate_page` with this size.
        unsafe { Self::dealloc(page, PAGE_SIZE) };
    }

    fn lv2_table(&self, pa: PhysicalAddress) -> NonNull<Lv2Table> {
        self.lv2[(pa.0 - LV2_PHYS_BASE) / LV2_TABLE_SIZE]
            .expect("second-level table address was not allocated by this allocator")
    }
}

// Copyright 2025 The sysmmu Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Translation domains.
//!
//! A [`TranslationDomain`] binds one set of translation tables to the devices
//! whose accesses they translate. It implements [`IommuOps`], the operation
//! set a generic IOMMU framework drives: attach and detach devices, map and
//! unmap ranges, translate addresses, and report the supported granules.
//!
//! Two domain-level locks exist deliberately: the page-table lock guards all
//! table mutation and walks, while a separate lock guards the owner list, so
//! an invalidation broadcast triggered from inside a mapping call (which
//! already holds the page-table lock) can iterate the owners without
//! deadlocking.

use crate::controller::{Activation, AttachError, Owner};
use crate::fault::FaultInfo;
use crate::paging::{
    align_down, IoVirtualAddress, PageSizes, Pagetable, PhysicalAddress, Prot, TableAllocator,
};
use crate::{AllocFailure, MapError, SysMmu};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{debug, warn};
use spin::Mutex;

/// Distinguishes a fresh attachment from a nested one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AttachOutcome {
    /// The device's controller chain was activated for this domain.
    Attached,
    /// The device was already attached to this domain; its activation count
    /// went up and a matching number of detaches is expected.
    AlreadyAttached,
}

/// A fault handler registered at domain creation. It observes every fault on
/// the domain first; returning `true` claims the fault as handled.
pub type FaultHandler = dyn Fn(&FaultInfo) -> bool + Send + Sync;

/// The operation set registered with the generic IOMMU framework.
pub trait IommuOps {
    fn attach_dev(&self, owner: &Arc<Owner>) -> Result<AttachOutcome, AttachError>;

    fn detach_dev(&self, owner: &Arc<Owner>);

    fn map(
        &self,
        iova: IoVirtualAddress,
        pa: PhysicalAddress,
        size: usize,
        prot: Prot,
    ) -> Result<(), MapError>;

    /// Unmaps the granule at `iova`, returning the size actually cleared, or
    /// zero on failure.
    fn unmap(&self, iova: IoVirtualAddress, size: usize) -> usize;

    fn iova_to_phys(&self, iova: IoVirtualAddress) -> Option<PhysicalAddress>;

    /// Bitmask of mapping granule sizes this domain supports.
    fn pgsize_bitmap(&self) -> usize;
}

/// One translation domain: tables, owners, and fault policy.
pub struct TranslationDomain<A: TableAllocator> {
    ctx: Arc<SysMmu<A>>,
    pagetable: Mutex<Pagetable>,
    owners: Mutex<Vec<Arc<Owner>>>,
    fault_handler: Option<Box<FaultHandler>>,
}

impl<A: TableAllocator> TranslationDomain<A> {
    /// Creates a domain whose first-level table is fully populated with the
    /// context's Fault sentinel, and registers the optional fault handler.
    pub fn new(
        ctx: Arc<SysMmu<A>>,
        page_sizes: PageSizes,
        fault_handler: Option<Box<FaultHandler>>,
    ) -> Result<Self, AllocFailure> {
        let pagetable = Pagetable::new(&mut *ctx.allocator().lock(), ctx.zero_link(), page_sizes)?;
        Ok(Self {
            ctx,
            pagetable: Mutex::new(pagetable),
            owners: Mutex::new(Vec::new()),
            fault_handler,
        })
    }

    /// Physical address of the first-level table, the base programmed into
    /// every controller attached to this domain.
    pub fn root_address(&self) -> PhysicalAddress {
        self.pagetable.lock().root_address()
    }

    pub(crate) fn for_each_owner(&self, mut f: impl FnMut(&Arc<Owner>)) {
        for owner in self.owners.lock().iter() {
            f(owner);
        }
    }

    pub(crate) fn report_fault(&self, info: &FaultInfo) -> bool {
        self.fault_handler.as_ref().is_some_and(|handler| handler(info))
    }

    /// Raw entry bits around `iova`, for fault diagnostics.
    pub fn entry_snapshot(&self, iova: IoVirtualAddress) -> (u32, Option<u32>) {
        let pagetable = self.pagetable.lock();
        let allocator = self.ctx.allocator().lock();
        pagetable.entry_snapshot(&*allocator, iova)
    }

    /// Maps the context's static zeroed page at the faulting address so a
    /// speculative re-access does not immediately fault again. Fault-recovery
    /// use only.
    pub(crate) fn install_fault_page(&self, iova: IoVirtualAddress) -> Result<(), MapError> {
        let page = align_down(iova.0, crate::paging::PAGE_SIZE);
        let fault_page = self.ctx.fault_page();
        let mut pagetable = self.pagetable.lock();
        let mut allocator = self.ctx.allocator().lock();
        let owners = &self.owners;
        pagetable.install_pages(
            &mut *allocator,
            IoVirtualAddress(page),
            fault_page,
            crate::paging::PAGE_SIZE,
            &mut |at| {
                for owner in owners.lock().iter() {
                    owner.flpd_cache_invalidate(at);
                }
            },
        )
    }

    #[cfg(test)]
    pub(crate) fn owner_count(&self) -> usize {
        self.owners.lock().len()
    }
}

impl<A: TableAllocator> IommuOps for TranslationDomain<A> {
    /// Activates the device's whole controller chain for this domain's
    /// table. A repeated attach is reported as [`AttachOutcome::AlreadyAttached`]
    /// rather than an error; the owner binding is only added on the first.
    fn attach_dev(&self, owner: &Arc<Owner>) -> Result<AttachOutcome, AttachError> {
        let root = self.pagetable.lock().root_address();
        let mut owners = self.owners.lock();
        match owner.attach(root)? {
            Activation::First => {
                owners.push(owner.clone());
                debug!("sysmmu domain {}: attached {}", root, owner.master());
                Ok(AttachOutcome::Attached)
            }
            Activation::Nested => Ok(AttachOutcome::AlreadyAttached),
        }
    }

    /// Lowers the device's activation count; the owner binding is removed
    /// only when the chain really reaches zero.
    fn detach_dev(&self, owner: &Arc<Owner>) {
        let mut owners = self.owners.lock();
        if owner.detach() {
            owners.retain(|o| !Arc::ptr_eq(o, owner));
            debug!("sysmmu domain: detached {}", owner.master());
        }
    }

    fn map(
        &self,
        iova: IoVirtualAddress,
        pa: PhysicalAddress,
        size: usize,
        prot: Prot,
    ) -> Result<(), MapError> {
        let mut pagetable = self.pagetable.lock();
        let mut allocator = self.ctx.allocator().lock();
        let owners = &self.owners;
        // First-level changes are broadcast to every owner before the map
        // call returns; a translation unit must never keep a stale cached
        // first-level descriptor past this point.
        pagetable.map_range(&mut *allocator, iova, pa, size, prot, &mut |at| {
            for owner in owners.lock().iter() {
                owner.flpd_cache_invalidate(at);
            }
        })
    }

    fn unmap(&self, iova: IoVirtualAddress, size: usize) -> usize {
        let mut pagetable = self.pagetable.lock();
        let result = {
            let allocator = self.ctx.allocator().lock();
            pagetable.unmap_at(&*allocator, iova, size)
        };
        match result {
            Ok(cleared) => {
                let base = IoVirtualAddress(align_down(iova.0, cleared));
                for owner in self.owners.lock().iter() {
                    owner.tlb_invalidate_range(base, cleared);
                }
                cleared
            }
            Err(e) => {
                warn!("sysmmu domain: {}", e);
                0
            }
        }
    }

    fn iova_to_phys(&self, iova: IoVirtualAddress) -> Option<PhysicalAddress> {
        let pagetable = self.pagetable.lock();
        let allocator = self.ctx.allocator().lock();
        pagetable.translate(&*allocator, iova)
    }

    fn pgsize_bitmap(&self) -> usize {
        self.pagetable.lock().page_sizes().bitmap()
    }
}

impl<A: TableAllocator> Drop for TranslationDomain<A> {
    /// Destroys the domain: every remaining owner is force-detached (looping
    /// until nested attaches are exhausted), then every second-level table
    /// and the first-level table are freed.
    fn drop(&mut self) {
        let owners: Vec<_> = self.owners.get_mut().drain(..).collect();
        for owner in owners {
            warn!(
                "sysmmu domain destroyed with {} still attached",
                owner.master()
            );
            while owner.controllers().iter().any(|unit| unit.is_active()) {
                owner.detach();
            }
        }
        self.pagetable
            .get_mut()
            .release(&mut *self.ctx.allocator().lock());
    }
}

// Copyright 2025 The sysmmu Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Fault decode, recovery and escalation.
//!
//! A translation unit raises an interrupt when an access faults. The handler
//! stalls the unit's pipeline, reads the fault kind and address, and decides:
//! plain page faults may be patched over with the context's static zeroed
//! page (the `recover` feature) so the master does not fault-storm, multi-hit
//! faults are TLB-consistency artifacts cured by an invalidation broadcast,
//! and everything else is fatal. A fatal fault is never a panic: it becomes a
//! typed [`FaultReport`] with the page-table and register diagnostics, for
//! the embedder's supervisor to act on.

use crate::control::{Direction, RegisterSnapshot};
use crate::controller::ControllerInstance;
use crate::domain::TranslationDomain;
use crate::iovmm::IoVirtualMemory;
use crate::paging::{IoVirtualAddress, TableAllocator};
use alloc::string::String;
use core::fmt::{self, Display, Formatter};
use log::{error, warn};

/// What a translation unit reported about a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultKind {
    /// No valid translation for the access. The only kind eligible for
    /// fault-page recovery.
    PageFault,
    /// More than one TLB entry matched: a cache-consistency artifact, cured
    /// by invalidation, not a mapping error.
    MultiHit,
    AccessViolation,
    SecurityViolation,
    BusError,
    /// The interrupt could not be correlated to a known cause.
    Undefined,
}

impl Display for FaultKind {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.write_str(match self {
            Self::PageFault => "PAGE FAULT",
            Self::MultiHit => "MULTI-HIT",
            Self::AccessViolation => "ACCESS VIOLATION",
            Self::SecurityViolation => "SECURITY VIOLATION",
            Self::BusError => "BUS ERROR",
            Self::Undefined => "UNDEFINED FAULT",
        })
    }
}

/// How a faulting address relates to the IO virtual memory manager's regions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultClass {
    /// No region contains the address: a true access to unmapped space,
    /// usually a driver bug in the master.
    UnmappedAccess,
    /// A live region contains the address but no translation is installed
    /// yet, which points at a mapping-ordering race.
    NotYetMapped,
}

/// One decoded fault event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FaultInfo {
    /// Name of the translation unit that raised the interrupt.
    pub unit: String,
    pub kind: FaultKind,
    pub direction: Direction,
    pub iova: IoVirtualAddress,
}

/// Diagnostics attached to a fatal fault.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FaultReport {
    pub info: FaultInfo,
    /// Raw first-level entry covering the faulting address.
    pub lv1_entry: u32,
    /// Raw second-level entry, when the first level is a table link.
    pub lv2_entry: Option<u32>,
    pub registers: RegisterSnapshot,
}

impl Display for FaultReport {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        writeln!(
            f,
            "{} ({:?}) by {} at {}",
            self.info.kind, self.info.direction, self.info.unit, self.info.iova
        )?;
        write!(f, "  Lv1 entry: {:#010x}", self.lv1_entry)?;
        if let Some(lv2) = self.lv2_entry {
            write!(f, ", Lv2 entry: {:#010x}", lv2)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "  CTRL {:#010x} CFG {:#010x} STATUS {:#010x}",
            self.registers.ctrl, self.registers.cfg, self.registers.status
        )?;
        write!(
            f,
            "  PT_BASE {:#010x} VERSION {:#06x} FAULT {:#010x}@{:#010x}",
            self.registers.pt_base,
            self.registers.version,
            self.registers.fault_status,
            self.registers.fault_address
        )
    }
}

/// The handler's verdict on one fault interrupt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The fault was absorbed; the master may continue. Carries the region
    /// classification when one was made.
    Recovered(Option<FaultClass>),
    /// Unrecoverable. The caller must escalate to its supervisor; the domain
    /// is left as it was for post-mortem inspection.
    Fatal(FaultReport),
}

/// Handles a fault interrupt from `unit`, which is attached to `domain`.
///
/// `iovmm` supplies the region list used to classify page faults; the
/// embedder passes the manager serving the faulting master when it has one.
/// A registered domain fault handler observes the fault first and may claim
/// it outright.
pub fn handle_fault<A: TableAllocator>(
    domain: &TranslationDomain<A>,
    unit: &ControllerInstance,
    iovmm: Option<&IoVirtualMemory>,
) -> FaultOutcome {
    let control = unit.control();
    // Stall the pipeline for a consistent diagnostic read. On timeout the
    // stall was already released; the status registers are read regardless.
    let stalled = control.block();
    if let Err(e) = stalled {
        warn!("sysmmu {}: {}", unit.name(), e);
    }
    let (kind, direction, iova) = control.read_fault_status();
    let info = FaultInfo {
        unit: unit.name().into(),
        kind,
        direction,
        iova,
    };

    let outcome = if domain.report_fault(&info) {
        FaultOutcome::Recovered(None)
    } else {
        match kind {
            FaultKind::PageFault => page_fault(domain, unit, iovmm, info),
            FaultKind::MultiHit => {
                warn!(
                    "sysmmu {}: multi-hit at {}, invalidating the stale entries",
                    unit.name(),
                    iova
                );
                domain.for_each_owner(|owner| owner.tlb_invalidate_entry(iova));
                FaultOutcome::Recovered(None)
            }
            _ => fatal(domain, unit, info),
        }
    };
    if stalled.is_ok() {
        control.unblock();
    }
    outcome
}

fn page_fault<A: TableAllocator>(
    domain: &TranslationDomain<A>,
    unit: &ControllerInstance,
    iovmm: Option<&IoVirtualMemory>,
    info: FaultInfo,
) -> FaultOutcome {
    let class = iovmm.map(|vm| match vm.find_region(info.iova) {
        Some(_) => FaultClass::NotYetMapped,
        None => FaultClass::UnmappedAccess,
    });
    match class {
        Some(FaultClass::NotYetMapped) => warn!(
            "sysmmu {}: page fault at {} inside a live region; the access may have raced its mapping",
            info.unit, info.iova
        ),
        Some(FaultClass::UnmappedAccess) => warn!(
            "sysmmu {}: {:?} access to unmapped address {}",
            info.unit, info.direction, info.iova
        ),
        None => warn!("sysmmu {}: page fault at {}", info.unit, info.iova),
    }
    if cfg!(feature = "recover") {
        // Point the faulting address at the static zeroed page so a
        // speculative retry by the master does not fault again.
        if let Err(e) = domain.install_fault_page(info.iova) {
            warn!(
                "sysmmu {}: could not install the fault page at {}: {}",
                info.unit, info.iova, e
            );
        }
        FaultOutcome::Recovered(class)
    } else {
        fatal(domain, unit, info)
    }
}

fn fatal<A: TableAllocator>(
    domain: &TranslationDomain<A>,
    unit: &ControllerInstance,
    info: FaultInfo,
) -> FaultOutcome {
    let (lv1_entry, lv2_entry) = domain.entry_snapshot(info.iova);
    let report = FaultReport {
        info,
        lv1_entry,
        lv2_entry,
        registers: unit.control().register_snapshot(),
    };
    error!("unrecoverable System MMU fault:\n{}", report);
    FaultOutcome::Fatal(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{Generation, Reg};
    use crate::controller::testing::make_unit;
    use crate::controller::Owner;
    use crate::domain::IommuOps;
    use crate::iovmm::SgEntry;
    use crate::paging::{PhysicalAddress, PAGE_SIZE};
    use crate::{HeapTables, Prot, SysMmu};
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec;
    use core::sync::atomic::{AtomicBool, Ordering};

    // Fault-status encodings of the V5 register layout used by the fakes.
    const V5_PAGE_FAULT_WRITE: u32 = (1 << 8) | 1;
    const V5_MULTI_HIT: u32 = 2;
    const V5_BUS_ERROR: u32 = 5;

    struct Bench {
        ctx: Arc<SysMmu<HeapTables>>,
        domain: TranslationDomain<HeapTables>,
        regs: Arc<crate::control::testing::FakeRegs>,
        unit: Arc<ControllerInstance>,
        owner: Arc<Owner>,
        vm: IoVirtualMemory,
    }

    fn make_bench(handler: Option<Box<crate::domain::FaultHandler>>) -> Bench {
        let ctx = SysMmu::new(HeapTables::new()).unwrap();
        let domain = TranslationDomain::new(
            ctx.clone(),
            Generation::V5.capabilities().page_sizes,
            handler,
        )
        .unwrap();
        let (regs, _clock, unit) = make_unit("tu0", Generation::V5, true);
        let owner = Arc::new(Owner::new("fimd", vec![unit.clone()]));
        domain.attach_dev(&owner).unwrap();
        let vm = IoVirtualMemory::new("fimd", &[(0x1000_0000, 0x1000_0000)]).unwrap();
        Bench {
            ctx,
            domain,
            regs,
            unit,
            owner,
            vm,
        }
    }

    #[test]
    #[cfg(feature = "recover")]
    fn page_fault_inside_region_recovers_as_not_yet_mapped() {
        let bench = make_bench(None);
        // A two-page region with a hole punched in its second page.
        let iova = bench
            .vm
            .map(
                &bench.domain,
                0,
                &vec![SgEntry {
                    pa: PhysicalAddress(0x8000_0000),
                    len: 2 * PAGE_SIZE,
                }],
                0,
                2 * PAGE_SIZE,
                Prot::READ,
            )
            .unwrap();
        let hole = iova + PAGE_SIZE;
        assert_eq!(bench.domain.unmap(hole, PAGE_SIZE), PAGE_SIZE);

        bench.regs.set_fault(V5_PAGE_FAULT_WRITE, hole.0 as u32);
        let outcome = handle_fault(&bench.domain, &bench.unit, Some(&bench.vm));
        assert_eq!(
            outcome,
            FaultOutcome::Recovered(Some(FaultClass::NotYetMapped))
        );
        // The faulting page now resolves to the static zeroed page.
        assert_eq!(
            bench.domain.iova_to_phys(hole),
            Some(bench.ctx.fault_page())
        );
        bench.domain.detach_dev(&bench.owner);
    }

    #[test]
    #[cfg(feature = "recover")]
    fn page_fault_outside_regions_classifies_as_unmapped_access() {
        let bench = make_bench(None);
        bench.regs.set_fault(V5_PAGE_FAULT_WRITE, 0x7000_0000);
        let outcome = handle_fault(&bench.domain, &bench.unit, Some(&bench.vm));
        assert_eq!(
            outcome,
            FaultOutcome::Recovered(Some(FaultClass::UnmappedAccess))
        );
        // Without a manager there is no classification at all.
        bench.regs.set_fault(V5_PAGE_FAULT_WRITE, 0x7100_0000);
        assert_eq!(
            handle_fault(&bench.domain, &bench.unit, None),
            FaultOutcome::Recovered(None)
        );
    }

    #[test]
    fn multi_hit_broadcasts_invalidation() {
        let bench = make_bench(None);
        bench.regs.set_fault(V5_MULTI_HIT, 0x1234_5000);
        let before = bench.regs.write_count(Reg::FlushEntry);
        assert_eq!(
            handle_fault(&bench.domain, &bench.unit, Some(&bench.vm)),
            FaultOutcome::Recovered(None)
        );
        assert_eq!(bench.regs.write_count(Reg::FlushEntry), before + 1);
        assert_eq!(bench.regs.last_write(Reg::FlushEntry), Some(0x1234_5000));
    }

    #[test]
    fn bus_error_is_fatal_with_diagnostics() {
        let bench = make_bench(None);
        bench.regs.set_fault(V5_BUS_ERROR, 0xdead_b000);
        let outcome = handle_fault(&bench.domain, &bench.unit, Some(&bench.vm));
        let FaultOutcome::Fatal(report) = outcome else {
            panic!("bus error must be fatal");
        };
        assert_eq!(report.info.kind, FaultKind::BusError);
        assert_eq!(report.info.unit, "tu0");
        assert_eq!(report.info.iova, IoVirtualAddress(0xdead_b000));
        assert_eq!(report.registers.fault_status, V5_BUS_ERROR);
        // The faulting slot is unmapped, so the dump shows the sentinel.
        assert_eq!(report.lv1_entry, bench.ctx.zero_link());
        let rendered = alloc::format!("{}", report);
        assert!(rendered.contains("BUS ERROR"));
        assert!(rendered.contains("tu0"));
    }

    #[test]
    fn undefined_status_is_fatal() {
        let bench = make_bench(None);
        bench.regs.set_fault(0, 0);
        assert!(matches!(
            handle_fault(&bench.domain, &bench.unit, None),
            FaultOutcome::Fatal(report) if report.info.kind == FaultKind::Undefined
        ));
    }

    #[test]
    fn registered_handler_claims_faults_first() {
        let seen = Arc::new(AtomicBool::new(false));
        let witness = seen.clone();
        let bench = make_bench(Some(Box::new(move |info: &FaultInfo| {
            witness.store(true, Ordering::Relaxed);
            info.kind == FaultKind::BusError
        })));
        bench.regs.set_fault(V5_BUS_ERROR, 0x4000_0000);
        assert_eq!(
            handle_fault(&bench.domain, &bench.unit, None),
            FaultOutcome::Recovered(None)
        );
        assert!(seen.load(Ordering::Relaxed));
    }

    #[test]
    fn stall_timeout_still_decodes_the_fault() {
        let bench = make_bench(None);
        bench.regs.wedge_pipeline();
        bench.regs.set_fault(V5_MULTI_HIT, 0x1000_1000);
        assert_eq!(
            handle_fault(&bench.domain, &bench.unit, None),
            FaultOutcome::Recovered(None)
        );
    }
}

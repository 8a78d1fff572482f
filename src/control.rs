// Copyright 2025 The sysmmu Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! The controller register interface.
//!
//! Every hardware generation exposes the same logical contract: enable and
//! disable translation, invalidate TLB and FLPD-cache state, program prefetch
//! buffers, and report fault status. Generations differ in which features
//! exist and how fault status is packed; both are captured by a
//! [`Capabilities`] set selected from the [`Generation`] at construction.
//! Register access itself goes through the [`RegisterIo`] trait, keyed by the
//! consolidated [`Reg`] map rather than per-version byte offsets, which are
//! the embedder's concern.

use crate::fault::FaultKind;
use crate::paging::{IoVirtualAddress, PageSizes, PhysicalAddress, PAGE_SIZE, SECTION_SIZE};
use alloc::boxed::Box;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::time::Duration;
use thiserror::Error;

/// The consolidated register map of a translation unit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Reg {
    /// Master control: enable and pipeline-block bits.
    Ctrl,
    /// Miscellaneous configuration (QoS).
    Cfg,
    /// Read-only status: pipeline-stalled flag.
    Status,
    /// Write-only: invalidate the whole TLB.
    FlushAll,
    /// Write-only: invalidate the TLB entry covering the written address.
    FlushEntry,
    /// Range invalidation window, inclusive start.
    FlushRangeStart,
    /// Range invalidation window, exclusive end.
    FlushRangeEnd,
    /// Write-only: invalidate the FLPD-cache entry covering the address.
    FlushFlpd,
    /// Physical address of the first-level table.
    PtBase,
    /// Read-only hardware version.
    Version,
    /// Read-only address of the last fault.
    FaultAddress,
    /// Read-only status of the last fault.
    FaultStatus,
    /// Prefetch buffer `n`, window start address.
    PbStart(u8),
    /// Prefetch buffer `n`, window end address.
    PbEnd(u8),
    /// Prefetch buffer `n`, configuration.
    PbCfg(u8),
}

/// Memory-mapped register access for one translation unit.
///
/// The embedder implements this over the unit's register window; tests use an
/// in-memory register file.
pub trait RegisterIo: Send + Sync {
    fn read(&self, reg: Reg) -> u32;
    fn write(&self, reg: Reg, value: u32);
}

bitflags! {
    /// Bits of [`Reg::Ctrl`].
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct CtrlFlags: u32 {
        const ENABLE = 1 << 0;
        /// Stall the translation pipeline; diagnostic state may only be read
        /// while [`StatusFlags::STALLED`] confirms the stall took effect.
        const BLOCK  = 1 << 1;
    }
}

bitflags! {
    /// Bits of [`Reg::Status`].
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct StatusFlags: u32 {
        const STALLED = 1 << 0;
    }
}

bitflags! {
    /// Bits of [`Reg::PbCfg`].
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PbCfgFlags: u32 {
        const ENABLE    = 1 << 0;
        /// Prefetch for writes instead of reads.
        const DIR_WRITE = 1 << 1;
    }
}

/// DMA direction of an access or prefetch stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

/// One prefetch-buffer window hint.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PrefetchBuffer {
    pub start: IoVirtualAddress,
    pub end: IoVirtualAddress,
    pub direction: Direction,
}

/// Hardware generations this driver consolidates.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Generation {
    V1,
    V2,
    V3_1,
    V3_2,
    V3_3,
    V5,
    V5_1,
}

impl Generation {
    /// Maps a raw version-register reading to a generation.
    pub fn from_version(major: u8, minor: u8) -> Result<Self, ConfigError> {
        match (major, minor) {
            (1, _) => Ok(Self::V1),
            (2, _) => Ok(Self::V2),
            (3, 0) | (3, 1) => Ok(Self::V3_1),
            (3, 2) => Ok(Self::V3_2),
            (3, 3) => Ok(Self::V3_3),
            (5, 0) => Ok(Self::V5),
            (5, 1) => Ok(Self::V5_1),
            _ => Err(ConfigError::UnknownVersion { major, minor }),
        }
    }

    /// The capability set of this generation.
    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::V1 => Capabilities {
                num_prefetch_buffers: 0,
                has_flpd_cache: false,
                has_range_invalidate: false,
                page_sizes: PageSizes::BASE,
            },
            Self::V2 => Capabilities {
                num_prefetch_buffers: 1,
                has_flpd_cache: false,
                has_range_invalidate: false,
                page_sizes: PageSizes::BASE,
            },
            Self::V3_1 => Capabilities {
                num_prefetch_buffers: 2,
                has_flpd_cache: false,
                has_range_invalidate: false,
                page_sizes: PageSizes::BASE,
            },
            Self::V3_2 => Capabilities {
                num_prefetch_buffers: 3,
                has_flpd_cache: false,
                has_range_invalidate: false,
                page_sizes: PageSizes::BASE,
            },
            Self::V3_3 => Capabilities {
                num_prefetch_buffers: 6,
                has_flpd_cache: true,
                has_range_invalidate: false,
                page_sizes: PageSizes::BASE,
            },
            Self::V5 => Capabilities {
                num_prefetch_buffers: 4,
                has_flpd_cache: true,
                has_range_invalidate: true,
                page_sizes: PageSizes {
                    large_section: Some(2 * SECTION_SIZE),
                },
            },
            Self::V5_1 => Capabilities {
                num_prefetch_buffers: 6,
                has_flpd_cache: true,
                has_range_invalidate: true,
                page_sizes: PageSizes {
                    large_section: Some(8 * SECTION_SIZE),
                },
            },
        }
    }
}

/// Feature set of one hardware generation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Capabilities {
    pub num_prefetch_buffers: usize,
    /// Whether first-level descriptors are prefetched into an FLPD cache
    /// that needs explicit invalidation on first-level entry changes.
    pub has_flpd_cache: bool,
    /// Whether the unit accepts a start/end invalidation window instead of
    /// per-entry flushes.
    pub has_range_invalidate: bool,
    pub page_sizes: PageSizes,
}

/// A monotonic time source for bounded register polling.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Timeout policy for the pipeline-stall wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StallPolicy {
    pub timeout: Duration,
}

impl StallPolicy {
    pub const DEFAULT: Self = Self {
        timeout: Duration::from_micros(500),
    };
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Configuration errors, reported when a controller is constructed rather
/// than asserted when the offending feature is first used.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown hardware version {major}.{minor}")]
    UnknownVersion { major: u8, minor: u8 },
    #[error("{requested} prefetch buffers requested but the unit has {available}")]
    TooManyPrefetchBuffers { requested: usize, available: usize },
    #[error("window masking cannot be combined with read/write prefetch properties")]
    ConflictingProperties,
    #[error("QoS value {0} is out of range")]
    InvalidQos(u8),
}

/// Errors from register sequences that poll the hardware.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ControlError {
    /// The pipeline did not report a stall within the timeout. The block bit
    /// has been cleared again; the unit is not left wedged.
    #[error("translation pipeline did not stall within {0:?}")]
    StallTimeout(Duration),
}

/// If a ranged invalidation covers more pages than this on a unit without a
/// range register, the whole TLB is flushed instead of one entry at a time.
const RANGE_FLUSH_MAX_PAGES: usize = 64;

/// The uniform control surface over one translation unit's registers.
pub struct Control {
    regs: Box<dyn RegisterIo>,
    caps: Capabilities,
    clock: Arc<dyn Clock>,
    stall: StallPolicy,
}

impl Control {
    pub fn new(
        regs: Box<dyn RegisterIo>,
        generation: Generation,
        clock: Arc<dyn Clock>,
        stall: StallPolicy,
    ) -> Self {
        Self {
            regs,
            caps: generation.capabilities(),
            clock,
            stall,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Programs the table base and starts translating.
    pub fn enable(&self, table_base: PhysicalAddress) {
        self.regs.write(Reg::PtBase, table_base.0 as u32);
        self.regs.write(Reg::FlushAll, 1);
        self.regs.write(Reg::Ctrl, CtrlFlags::ENABLE.bits());
    }

    /// Stops translating; every access passes through untranslated faulting
    /// state until the next enable.
    pub fn disable(&self) {
        self.regs.write(Reg::Ctrl, 0);
    }

    pub fn set_qos(&self, qos: u8) {
        self.regs.write(Reg::Cfg, qos as u32);
    }

    pub fn tlb_invalidate_all(&self) {
        self.regs.write(Reg::FlushAll, 1);
    }

    pub fn tlb_invalidate_entry(&self, iova: IoVirtualAddress) {
        self.regs.write(Reg::FlushEntry, iova.0 as u32);
    }

    /// Invalidates every TLB entry intersecting `[iova, iova + size)`.
    pub fn tlb_invalidate_range(&self, iova: IoVirtualAddress, size: usize) {
        if self.caps.has_range_invalidate {
            self.regs.write(Reg::FlushRangeStart, iova.0 as u32);
            self.regs.write(Reg::FlushRangeEnd, (iova.0 + size) as u32);
            return;
        }
        let pages = size / PAGE_SIZE;
        if pages > RANGE_FLUSH_MAX_PAGES {
            self.tlb_invalidate_all();
        } else {
            for page in 0..pages {
                self.tlb_invalidate_entry(iova + page * PAGE_SIZE);
            }
        }
    }

    /// Invalidates the FLPD-cache entry covering `iova`. No-op on
    /// generations without an FLPD cache.
    pub fn flpd_cache_invalidate(&self, iova: IoVirtualAddress) {
        if self.caps.has_flpd_cache {
            self.regs.write(Reg::FlushFlpd, iova.0 as u32);
        }
    }

    /// Programs the prefetch-buffer windows and disables the rest.
    pub fn configure_prefetch_buffers(
        &self,
        buffers: &[PrefetchBuffer],
    ) -> Result<(), ConfigError> {
        let available = self.caps.num_prefetch_buffers;
        if buffers.len() > available {
            return Err(ConfigError::TooManyPrefetchBuffers {
                requested: buffers.len(),
                available,
            });
        }
        for (index, buffer) in buffers.iter().enumerate() {
            let index = index as u8;
            self.regs.write(Reg::PbStart(index), buffer.start.0 as u32);
            self.regs.write(Reg::PbEnd(index), buffer.end.0 as u32);
            let mut cfg = PbCfgFlags::ENABLE;
            if buffer.direction == Direction::Write {
                cfg |= PbCfgFlags::DIR_WRITE;
            }
            self.regs.write(Reg::PbCfg(index), cfg.bits());
        }
        for index in buffers.len()..available {
            self.regs.write(Reg::PbCfg(index as u8), 0);
        }
        Ok(())
    }

    /// Reads the hardware version as `(major, minor)`.
    pub fn read_version(&self) -> (u8, u8) {
        let raw = self.regs.read(Reg::Version);
        (((raw >> 8) & 0xff) as u8, (raw & 0xff) as u8)
    }

    /// Decodes the last fault recorded by the unit.
    pub fn read_fault_status(&self) -> (FaultKind, Direction, IoVirtualAddress) {
        let status = self.regs.read(Reg::FaultStatus);
        let address = IoVirtualAddress(self.regs.read(Reg::FaultAddress) as usize);
        let (kind, direction) = if self.caps.has_range_invalidate {
            decode_fault_v5(status)
        } else {
            decode_fault_v3(status)
        };
        (kind, direction, address)
    }

    /// Stalls the translation pipeline so diagnostic state can be read
    /// consistently. Bounded by the stall policy; on timeout the block bit is
    /// cleared again before the error returns.
    pub fn block(&self) -> Result<(), ControlError> {
        let ctrl = self.regs.read(Reg::Ctrl);
        self.regs
            .write(Reg::Ctrl, ctrl | CtrlFlags::BLOCK.bits());
        let start = self.clock.now();
        loop {
            let status = StatusFlags::from_bits_retain(self.regs.read(Reg::Status));
            if status.contains(StatusFlags::STALLED) {
                return Ok(());
            }
            if self.clock.now().saturating_sub(start) > self.stall.timeout {
                self.unblock();
                return Err(ControlError::StallTimeout(self.stall.timeout));
            }
            core::hint::spin_loop();
        }
    }

    /// Releases a pipeline stall.
    pub fn unblock(&self) {
        let ctrl = self.regs.read(Reg::Ctrl);
        self.regs
            .write(Reg::Ctrl, ctrl & !CtrlFlags::BLOCK.bits());
    }

    /// Raw values of the diagnostic registers, for fatal-fault reports.
    pub fn register_snapshot(&self) -> RegisterSnapshot {
        RegisterSnapshot {
            ctrl: self.regs.read(Reg::Ctrl),
            cfg: self.regs.read(Reg::Cfg),
            status: self.regs.read(Reg::Status),
            pt_base: self.regs.read(Reg::PtBase),
            version: self.regs.read(Reg::Version),
            fault_status: self.regs.read(Reg::FaultStatus),
            fault_address: self.regs.read(Reg::FaultAddress),
        }
    }
}

/// Diagnostic register values captured when a fault is escalated.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegisterSnapshot {
    pub ctrl: u32,
    pub cfg: u32,
    pub status: u32,
    pub pt_base: u32,
    pub version: u32,
    pub fault_status: u32,
    pub fault_address: u32,
}

// V1-V3 units report the fault cause as a one-hot interrupt bit, read and
// write sides separately.
fn decode_fault_v3(status: u32) -> (FaultKind, Direction) {
    match status.trailing_zeros() {
        0 => (FaultKind::PageFault, Direction::Read),
        1 => (FaultKind::MultiHit, Direction::Read),
        2 => (FaultKind::MultiHit, Direction::Write),
        3 => (FaultKind::BusError, Direction::Read),
        4 => (FaultKind::SecurityViolation, Direction::Read),
        5 => (FaultKind::AccessViolation, Direction::Read),
        6 => (FaultKind::SecurityViolation, Direction::Write),
        7 => (FaultKind::AccessViolation, Direction::Write),
        8 => (FaultKind::PageFault, Direction::Write),
        _ => (FaultKind::Undefined, Direction::Read),
    }
}

// V5 units report a cause code plus a direction bit.
fn decode_fault_v5(status: u32) -> (FaultKind, Direction) {
    let direction = if status & (1 << 8) != 0 {
        Direction::Write
    } else {
        Direction::Read
    };
    let kind = match status & 0xf {
        1 => FaultKind::PageFault,
        2 => FaultKind::MultiHit,
        3 => FaultKind::AccessViolation,
        4 => FaultKind::SecurityViolation,
        5 => FaultKind::BusError,
        _ => FaultKind::Undefined,
    };
    (kind, direction)
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory fakes for the hardware seams.

    use super::*;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU64, Ordering};
    use spin::Mutex;

    struct FakeState {
        ctrl: u32,
        cfg: u32,
        pt_base: u32,
        version: u32,
        fault_status: u32,
        fault_address: u32,
        pb: [(u32, u32, u32); 8],
        /// When set the status register never reports a stall.
        wedge_pipeline: bool,
        writes: Vec<(Reg, u32)>,
    }

    /// A register file with just enough behaviour for the driver sequences:
    /// the stall flag tracks the block bit unless wedged, and every write is
    /// logged for assertions.
    pub(crate) struct FakeRegs {
        state: Mutex<FakeState>,
    }

    impl FakeRegs {
        pub(crate) fn new(major: u8, minor: u8) -> Self {
            Self {
                state: Mutex::new(FakeState {
                    ctrl: 0,
                    cfg: 0,
                    pt_base: 0,
                    version: ((major as u32) << 8) | minor as u32,
                    fault_status: 0,
                    fault_address: 0,
                    pb: [(0, 0, 0); 8],
                    wedge_pipeline: false,
                    writes: Vec::new(),
                }),
            }
        }

        pub(crate) fn set_fault(&self, status: u32, address: u32) {
            let mut state = self.state.lock();
            state.fault_status = status;
            state.fault_address = address;
        }

        pub(crate) fn wedge_pipeline(&self) {
            self.state.lock().wedge_pipeline = true;
        }

        pub(crate) fn writes(&self) -> Vec<(Reg, u32)> {
            self.state.lock().writes.clone()
        }

        pub(crate) fn write_count(&self, reg: Reg) -> usize {
            self.state
                .lock()
                .writes
                .iter()
                .filter(|(r, _)| *r == reg)
                .count()
        }

        pub(crate) fn last_write(&self, reg: Reg) -> Option<u32> {
            self.state
                .lock()
                .writes
                .iter()
                .rev()
                .find(|(r, _)| *r == reg)
                .map(|&(_, v)| v)
        }

        pub(crate) fn ctrl(&self) -> u32 {
            self.state.lock().ctrl
        }
    }

    impl RegisterIo for FakeRegs {
        fn read(&self, reg: Reg) -> u32 {
            let state = self.state.lock();
            match reg {
                Reg::Ctrl => state.ctrl,
                Reg::Cfg => state.cfg,
                Reg::Status => {
                    let blocked = state.ctrl & CtrlFlags::BLOCK.bits() != 0;
                    if blocked && !state.wedge_pipeline {
                        StatusFlags::STALLED.bits()
                    } else {
                        0
                    }
                }
                Reg::PtBase => state.pt_base,
                Reg::Version => state.version,
                Reg::FaultStatus => state.fault_status,
                Reg::FaultAddress => state.fault_address,
                Reg::PbStart(n) => state.pb[n as usize].0,
                Reg::PbEnd(n) => state.pb[n as usize].1,
                Reg::PbCfg(n) => state.pb[n as usize].2,
                _ => 0,
            }
        }

        fn write(&self, reg: Reg, value: u32) {
            let mut state = self.state.lock();
            state.writes.push((reg, value));
            match reg {
                Reg::Ctrl => state.ctrl = value,
                Reg::Cfg => state.cfg = value,
                Reg::PtBase => state.pt_base = value,
                Reg::PbStart(n) => state.pb[n as usize].0 = value,
                Reg::PbEnd(n) => state.pb[n as usize].1 = value,
                Reg::PbCfg(n) => state.pb[n as usize].2 = value,
                _ => {}
            }
        }
    }

    /// Lets several handles share one register file, as tests need both the
    /// driver's `Box<dyn RegisterIo>` and their own handle for assertions.
    pub(crate) struct SharedRegs(pub(crate) alloc::sync::Arc<FakeRegs>);

    impl RegisterIo for SharedRegs {
        fn read(&self, reg: Reg) -> u32 {
            self.0.read(reg)
        }

        fn write(&self, reg: Reg, value: u32) {
            self.0.write(reg, value)
        }
    }

    /// A clock that advances by a fixed step every reading, so polling loops
    /// terminate deterministically.
    pub(crate) struct SteppingClock {
        now: AtomicU64,
        step: u64,
    }

    impl SteppingClock {
        pub(crate) fn new(step: Duration) -> Self {
            Self {
                now: AtomicU64::new(0),
                step: step.as_nanos() as u64,
            }
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> Duration {
            Duration::from_nanos(self.now.fetch_add(self.step, Ordering::Relaxed))
        }
    }
}

// Copyright 2025 The sysmmu Authors.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Controller instances and the devices they serve.
//!
//! A [`ControllerInstance`] is one hardware translation unit. It reference
//! counts activation: only the 0-to-1 transition programs the registers and
//! only the 1-to-0 transition disables them, and both are further gated by
//! the runtime power state of the owning domain. A master device may be
//! guarded by a chain of several units; [`Owner`] walks the whole chain for
//! attach, detach and invalidation.
//!
//! Two locks are involved, always in the same order: the owner lock
//! serialises operations against a device's chain, and each instance's state
//! lock serialises its activation counter and register programming. The
//! instance lock is taken once per unit inside a chain walk, never the other
//! way around.

use crate::control::{
    Capabilities, Clock, ConfigError, Control, Direction, Generation, PrefetchBuffer, RegisterIo,
    StallPolicy,
};
use crate::paging::{IoVirtualAddress, PhysicalAddress};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use log::{debug, warn};
use spin::Mutex;
use thiserror::Error;

/// A gateable clock feeding a translation unit.
///
/// Units have a gating clock and optionally a master bus clock; both are held
/// enabled while the unit is programmed and translating.
pub trait GateClock: Send + Sync {
    fn enable(&self);
    fn disable(&self);
}

bitflags! {
    /// Per-instance prefetch properties of the master device.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct Properties: u32 {
        /// Prefetch on the read path.
        const READ        = 1 << 0;
        /// Prefetch on the write path.
        const WRITE       = 1 << 1;
        /// Restrict prefetch to explicitly-configured windows.
        const WINDOW_MASK = 1 << 2;
    }
}

const QOS_MAX: u8 = 15;

/// Probe-time configuration of one translation unit.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub name: String,
    pub generation: Generation,
    pub properties: Properties,
    pub qos: Option<u8>,
    pub prefetch: Vec<PrefetchBuffer>,
    pub stall: StallPolicy,
}

impl ControllerConfig {
    pub fn new(name: impl Into<String>, generation: Generation) -> Self {
        Self {
            name: name.into(),
            generation,
            properties: Properties::empty(),
            qos: None,
            prefetch: Vec::new(),
            stall: StallPolicy::DEFAULT,
        }
    }

    /// Rejects configurations the hardware cannot honour. Window masking and
    /// directional prefetch select mutually exclusive buffer layouts, so the
    /// combination is refused here instead of tripping an assertion when the
    /// buffers are programmed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.properties.contains(Properties::WINDOW_MASK)
            && self
                .properties
                .intersects(Properties::READ | Properties::WRITE)
        {
            return Err(ConfigError::ConflictingProperties);
        }
        if let Some(qos) = self.qos {
            if qos > QOS_MAX {
                return Err(ConfigError::InvalidQos(qos));
            }
        }
        let available = self.generation.capabilities().num_prefetch_buffers;
        if self.prefetch.len() > available {
            return Err(ConfigError::TooManyPrefetchBuffers {
                requested: self.prefetch.len(),
                available,
            });
        }
        Ok(())
    }
}

/// Errors from attach attempts.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum AttachError {
    /// The unit already translates for a different table base. One unit
    /// cannot serve two domains; the attach is refused, never retried.
    #[error("unit is active with table base {current}, cannot switch to {requested}")]
    Busy {
        current: PhysicalAddress,
        requested: PhysicalAddress,
    },
}

/// Whether an enable call was the one that activated the unit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Activation {
    /// The 0-to-1 transition; registers were programmed (if powered).
    First,
    /// The unit was already active under the same table base.
    Nested,
}

struct ActivationState {
    count: u32,
    table_base: Option<PhysicalAddress>,
    /// Runtime power state of the owning domain. While off, enable/disable
    /// track the logical state but defer register programming.
    powered: bool,
}

/// One hardware translation unit.
pub struct ControllerInstance {
    name: String,
    control: Control,
    gate_clock: Box<dyn GateClock>,
    master_clock: Option<Box<dyn GateClock>>,
    qos: Option<u8>,
    prefetch: Vec<PrefetchBuffer>,
    state: Mutex<ActivationState>,
}

impl ControllerInstance {
    /// Builds a unit from its probe data. The configuration is validated
    /// here; the version reported by the hardware is checked against the
    /// configured generation as a probe diagnostic.
    pub fn new(
        config: ControllerConfig,
        regs: Box<dyn RegisterIo>,
        clock: Arc<dyn Clock>,
        gate_clock: Box<dyn GateClock>,
        master_clock: Option<Box<dyn GateClock>>,
        powered: bool,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let control = Control::new(regs, config.generation, clock, config.stall);
        let (major, minor) = control.read_version();
        match Generation::from_version(major, minor) {
            Ok(reported) if reported == config.generation => {}
            _ => warn!(
                "sysmmu {}: hardware reports version {}.{}, configured as {:?}",
                config.name, major, minor, config.generation
            ),
        }
        // Directional properties gate which windows reach the hardware; a
        // window-masked unit takes its configured windows as-is. Resolved
        // here once so register programming never allocates.
        let prefetch = if config.properties.contains(Properties::WINDOW_MASK)
            || config.properties.is_empty()
        {
            config.prefetch
        } else {
            config
                .prefetch
                .into_iter()
                .filter(|buffer| match buffer.direction {
                    Direction::Read => config.properties.contains(Properties::READ),
                    Direction::Write => config.properties.contains(Properties::WRITE),
                })
                .collect()
        };
        Ok(Self {
            name: config.name,
            control,
            gate_clock,
            master_clock,
            qos: config.qos,
            prefetch,
            state: Mutex::new(ActivationState {
                count: 0,
                table_base: None,
                powered,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> Capabilities {
        self.control.capabilities()
    }

    pub(crate) fn control(&self) -> &Control {
        &self.control
    }

    /// Whether the activation count is non-zero.
    pub fn is_active(&self) -> bool {
        self.state.lock().count > 0
    }

    #[cfg(test)]
    pub(crate) fn activation_count(&self) -> u32 {
        self.state.lock().count
    }

    /// Raises the activation count for `table_base`.
    ///
    /// The first activation records the base and, if the domain is powered,
    /// programs the unit. Re-activation under the same base is an idempotent
    /// success; a different base is refused as [`AttachError::Busy`].
    pub fn enable(&self, table_base: PhysicalAddress) -> Result<Activation, AttachError> {
        let mut state = self.state.lock();
        match state.table_base {
            Some(current) if current != table_base => Err(AttachError::Busy {
                current,
                requested: table_base,
            }),
            Some(_) => {
                state.count += 1;
                Ok(Activation::Nested)
            }
            None => {
                state.count = 1;
                state.table_base = Some(table_base);
                if state.powered {
                    self.program(table_base);
                }
                debug!("sysmmu {}: activated for table {}", self.name, table_base);
                Ok(Activation::First)
            }
        }
    }

    /// Lowers the activation count, returning whether this call reached zero
    /// (and thus actually disabled the unit). Callers use the return value to
    /// decide whether the device leaves its domain's owner list.
    pub fn disable(&self) -> bool {
        let mut state = self.state.lock();
        match state.count {
            0 => {
                warn!("sysmmu {}: disable while inactive", self.name);
                false
            }
            1 => {
                state.count = 0;
                state.table_base = None;
                if state.powered {
                    self.unprogram();
                }
                debug!("sysmmu {}: deactivated", self.name);
                true
            }
            _ => {
                state.count -= 1;
                false
            }
        }
    }

    /// Power-domain suspend callback: stops the unit without touching the
    /// activation count. The logical attachment survives power gating.
    pub fn runtime_suspend(&self) {
        let mut state = self.state.lock();
        if state.powered {
            if state.count > 0 {
                self.unprogram();
            }
            state.powered = false;
        }
    }

    /// Power-domain resume callback: reprograms the unit if it is logically
    /// active.
    pub fn runtime_resume(&self) {
        let mut state = self.state.lock();
        if !state.powered {
            state.powered = true;
            if let (1.., Some(table_base)) = (state.count, state.table_base) {
                self.program(table_base);
            }
        }
    }

    fn program(&self, table_base: PhysicalAddress) {
        self.gate_clock.enable();
        if let Some(master) = &self.master_clock {
            master.enable();
        }
        self.control.enable(table_base);
        if let Some(qos) = self.qos {
            self.control.set_qos(qos);
        }
        if let Err(e) = self.control.configure_prefetch_buffers(&self.prefetch) {
            // Validated at construction, so this only fires on a capability
            // regression in the hardware description.
            warn!("sysmmu {}: prefetch configuration rejected: {}", self.name, e);
        }
    }

    fn unprogram(&self) {
        self.control.disable();
        if let Some(master) = &self.master_clock {
            master.disable();
        }
        self.gate_clock.disable();
    }

    /// TLB maintenance, issued only while the unit is active and powered.
    pub fn tlb_invalidate_entry(&self, iova: IoVirtualAddress) {
        let state = self.state.lock();
        if state.count > 0 && state.powered {
            self.control.tlb_invalidate_entry(iova);
        }
    }

    pub fn tlb_invalidate_range(&self, iova: IoVirtualAddress, size: usize) {
        let state = self.state.lock();
        if state.count > 0 && state.powered {
            self.control.tlb_invalidate_range(iova, size);
        }
    }

    pub fn tlb_invalidate_all(&self) {
        let state = self.state.lock();
        if state.count > 0 && state.powered {
            self.control.tlb_invalidate_all();
        }
    }

    pub fn flpd_cache_invalidate(&self, iova: IoVirtualAddress) {
        let state = self.state.lock();
        if state.count > 0 && state.powered {
            self.control.flpd_cache_invalidate(iova);
        }
    }
}

/// A master device and the chain of translation units guarding it.
///
/// The chain is fixed at probe time; the owner lock serialises every
/// operation that walks it.
pub struct Owner {
    master: String,
    chain: Vec<Arc<ControllerInstance>>,
    lock: Mutex<()>,
}

impl Owner {
    pub fn new(master: impl Into<String>, chain: Vec<Arc<ControllerInstance>>) -> Self {
        Self {
            master: master.into(),
            chain,
            lock: Mutex::new(()),
        }
    }

    pub fn master(&self) -> &str {
        &self.master
    }

    pub fn controllers(&self) -> &[Arc<ControllerInstance>] {
        &self.chain
    }

    /// Enables every unit in the chain for `table_base`.
    ///
    /// Chains move in lockstep, so the first unit's outcome is the chain's.
    /// If a unit partway through refuses, the units already enabled by this
    /// call are disabled again before the error returns; no partial
    /// multi-unit attachment is left active.
    pub fn attach(&self, table_base: PhysicalAddress) -> Result<Activation, AttachError> {
        let _guard = self.lock.lock();
        let mut outcome = Activation::First;
        for (walked, unit) in self.chain.iter().enumerate() {
            match unit.enable(table_base) {
                Ok(activation) => {
                    if walked == 0 {
                        outcome = activation;
                    } else if activation != outcome {
                        warn!(
                            "sysmmu chain of {}: unit {} out of lockstep",
                            self.master,
                            unit.name()
                        );
                    }
                }
                Err(e) => {
                    for enabled in &self.chain[..walked] {
                        enabled.disable();
                    }
                    return Err(e);
                }
            }
        }
        Ok(outcome)
    }

    /// Disables every unit in the chain once, returning whether the chain
    /// reached zero (the first unit's answer; chains move in lockstep).
    pub fn detach(&self) -> bool {
        let _guard = self.lock.lock();
        let mut reached_zero = false;
        for (walked, unit) in self.chain.iter().enumerate() {
            let zero = unit.disable();
            if walked == 0 {
                reached_zero = zero;
            }
        }
        reached_zero
    }

    pub fn tlb_invalidate_entry(&self, iova: IoVirtualAddress) {
        let _guard = self.lock.lock();
        for unit in &self.chain {
            unit.tlb_invalidate_entry(iova);
        }
    }

    pub fn tlb_invalidate_range(&self, iova: IoVirtualAddress, size: usize) {
        let _guard = self.lock.lock();
        for unit in &self.chain {
            unit.tlb_invalidate_range(iova, size);
        }
    }

    pub fn flpd_cache_invalidate(&self, iova: IoVirtualAddress) {
        let _guard = self.lock.lock();
        for unit in &self.chain {
            unit.flpd_cache_invalidate(iova);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fake clocks and a ready-made unit for driver tests.

    use super::*;
    use crate::control::testing::{FakeRegs, SharedRegs, SteppingClock};
    use core::sync::atomic::{AtomicIsize, Ordering};
    use core::time::Duration;

    /// A gate clock that tracks its enable/disable balance.
    #[derive(Default)]
    pub(crate) struct CountingClock {
        balance: AtomicIsize,
    }

    impl CountingClock {
        pub(crate) fn balance(&self) -> isize {
            self.balance.load(Ordering::Relaxed)
        }
    }

    impl GateClock for CountingClock {
        fn enable(&self) {
            self.balance.fetch_add(1, Ordering::Relaxed);
        }

        fn disable(&self) {
            self.balance.fetch_sub(1, Ordering::Relaxed);
        }
    }

    impl GateClock for Arc<CountingClock> {
        fn enable(&self) {
            self.as_ref().enable()
        }

        fn disable(&self) {
            self.as_ref().disable()
        }
    }

    pub(crate) fn make_unit(
        name: &str,
        generation: Generation,
        powered: bool,
    ) -> (Arc<FakeRegs>, Arc<CountingClock>, Arc<ControllerInstance>) {
        let (major, minor) = match generation {
            Generation::V1 => (1, 0),
            Generation::V2 => (2, 0),
            Generation::V3_1 => (3, 1),
            Generation::V3_2 => (3, 2),
            Generation::V3_3 => (3, 3),
            Generation::V5 => (5, 0),
            Generation::V5_1 => (5, 1),
        };
        let regs = Arc::new(FakeRegs::new(major, minor));
        let clock = Arc::new(CountingClock::default());
        let unit = ControllerInstance::new(
            ControllerConfig::new(name, generation),
            Box::new(SharedRegs(regs.clone())),
            Arc::new(SteppingClock::new(Duration::from_micros(10))),
            Box::new(clock.clone()),
            None,
            powered,
        )
        .unwrap();
        (regs, clock, Arc::new(unit))
    }
}

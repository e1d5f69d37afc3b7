//! Device-page registry and the peripheral adapters that sit behind it
//! (spec §4.3 DEV dispatch, §4.8 peripheral adapters).
//!
//! Per spec §9's "global mutable state" design note, the registry is an
//! owned collection on [`crate::machine::Machine`], never a process-wide
//! static — two machines in one process see disjoint device state.

use hashbrown::HashMap;
use m65832_macros::SoftSwitches;

use crate::bus::AccessIntent;
use crate::errors::Fault;
use crate::pte::DevicePageId;

/// The sub-decoded contract a device-page handler implements. Per spec
/// §9's "polymorphism by capability set, not inheritance" note, handlers
/// are described by this trait rather than by a shared base class.
pub trait DeviceHandler: Send {
    /// Services a data-path access (live side effects permitted).
    fn access(&mut self, offset: u32, intent: AccessIntent, value: Option<u8>) -> Result<u8, Fault>;

    /// Enumerates this device's published soft switches, if any (spec
    /// §4.8). Most devices have none.
    fn soft_switches(&self) -> Vec<(&'static str, u32, bool, &'static str)> {
        Vec::new()
    }
}

/// Resolves Device Page IDs to concrete handlers. One instance per
/// [`crate::machine::Machine`].
#[derive(Default)]
pub struct DeviceRegistry {
    handlers: HashMap<DevicePageId, Box<dyn DeviceHandler>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: DevicePageId, handler: Box<dyn DeviceHandler>) {
        self.handlers.insert(id, handler);
    }

    pub fn unregister(&mut self, id: DevicePageId) {
        self.handlers.remove(&id);
    }

    /// Dispatches an access. An unregistered Device Page ID raises
    /// `DeviceFault`, exactly like a handler that rejects the access
    /// (spec §4.3: "both... raise `DeviceFault`").
    pub fn dispatch(
        &mut self,
        id: DevicePageId,
        va: u32,
        offset: u32,
        intent: AccessIntent,
        value: Option<u8>,
    ) -> Result<u8, Fault> {
        match self.handlers.get_mut(&id) {
            Some(handler) => handler.access(offset, intent, value).map_err(|_| Fault::DeviceFault { va }),
            None => {
                if intent.is_debug() {
                    Ok(0xFF)
                } else {
                    Err(Fault::DeviceFault { va })
                }
            }
        }
    }

    /// Enumerates every soft switch published by a registered handler,
    /// for the debug observer interface (spec §4.8).
    pub fn enumerate_soft_switches(&self) -> Vec<(&'static str, u32, bool, &'static str)> {
        self.handlers
            .values()
            .flat_map(|h| h.soft_switches())
            .collect()
    }
}

/// The `$C030` speaker toggle device (spec §4.8).
///
/// Any access with live side effects toggles the one-bit state and appends
/// a `(cycle, new_state)` tuple to the toggle history. Peek accesses never
/// toggle — this is the property spec §8 quantifies as "for all peek
/// intents, no device toggle history grows".
#[derive(SoftSwitches)]
pub struct Speaker {
    #[switch(addr = 0xC030, name = "SPEAKER", desc = "one-bit speaker toggle")]
    state: bool,
    history: Vec<(u64, bool)>,
    cycle: u64,
}

impl Speaker {
    pub fn new() -> Self {
        Self {
            state: false,
            history: Vec::new(),
            cycle: 0,
        }
    }

    /// Advances the device's notion of the current cycle. The CPU core
    /// calls this once per instruction boundary so toggle timestamps line
    /// up with the bus access records that triggered them.
    pub fn set_cycle(&mut self, cycle: u64) {
        self.cycle = cycle;
    }

    pub fn state(&self) -> bool {
        self.state
    }

    pub fn toggle_count(&self) -> usize {
        self.history.len()
    }

    pub fn history(&self) -> &[(u64, bool)] {
        &self.history
    }

    /// A pull-based, cycle-timestamped stream of toggle events, per spec
    /// §9's "cycle-time coroutines" design note — an audio renderer
    /// consumes this on its own schedule instead of being driven by a
    /// cooperative thread signaled from inside the core.
    pub fn toggle_stream(&self) -> impl futures_lite::Stream<Item = (u64, bool)> + '_ {
        futures_lite::stream::iter(self.history.iter().copied())
    }
}

impl Default for Speaker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceHandler for Speaker {
    fn access(&mut self, offset: u32, intent: AccessIntent, _value: Option<u8>) -> Result<u8, Fault> {
        if offset != 0 {
            // Only the single $C030 soft switch lives on this handler's page.
            return Ok(0xFF);
        }
        if !intent.is_debug() {
            self.state = !self.state;
            self.history.push((self.cycle, self.state));
        }
        Ok(if self.state { 0xFF } else { 0x00 })
    }

    fn soft_switches(&self) -> Vec<(&'static str, u32, bool, &'static str)> {
        Speaker::soft_switches(self)
    }
}

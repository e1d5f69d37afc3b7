//! Cooperative scheduler and signal bus (spec §4.7/§5).
//!
//! The CPU's `step()` is the sole driver of logical time; the scheduler
//! just interposes between steps to deliver due signals and to let
//! auxiliary threads (an audio renderer, a UI refresh timer) hand events
//! to the machine thread without blocking it. `crossbeam-channel` is the
//! cross-thread handoff; ordering and cancellation are plain in-process
//! bookkeeping once an event has been received.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::bus::Bus;
use crate::cpu::{Cpu, InterruptKind, StopReason};
use crate::devpage::DeviceRegistry;

/// Identifies the peripheral that deposited a [`CycleEvent`], for
/// diagnostics and for targeted cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

/// What kind of signal a [`CycleEvent`] delivers at the instruction
/// boundary it becomes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Nmi,
    Irq,
    /// A scheduler-internal wakeup with no CPU-visible effect; used by
    /// peripherals that only need to be polled at a cycle deadline.
    Timer,
}

/// The concrete payload the signal bus moves (spec §3 supplement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleEvent {
    pub cycle: u64,
    pub kind: SignalKind,
    pub source: DeviceId,
    seq: u64,
}

/// Publish/subscribe channel for cycle-stamped peripheral events.
///
/// Ordering (spec §4.7): events with lower cycle timestamps are delivered
/// first; ties are broken by registration order, tracked here as a
/// monotonic sequence number assigned at [`SignalBus::publish`] time.
pub struct SignalBus {
    sender: Sender<CycleEvent>,
    receiver: Receiver<CycleEvent>,
    pending: Vec<CycleEvent>,
    next_seq: u64,
}

impl SignalBus {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            pending: Vec::new(),
            next_seq: 0,
        }
    }

    /// A cloneable handle a peripheral (possibly on another thread) uses to
    /// deposit events without touching the bus's internal ordering state.
    pub fn publisher(&self) -> SignalPublisher {
        SignalPublisher {
            sender: self.sender.clone(),
        }
    }

    /// Deposits an event directly, for the common case of a peripheral
    /// living on the same thread as the scheduler.
    pub fn publish(&mut self, cycle: u64, kind: SignalKind, source: DeviceId) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let _ = self.sender.send(CycleEvent { cycle, kind, source, seq });
    }

    /// Withdraws every not-yet-delivered event from `source`, matching the
    /// cancellation rule in spec §4.7: a source may withdraw its own event
    /// until the instruction that would observe it completes. Events
    /// already handed to a receiver's channel buffer but not yet drained
    /// into `pending` are picked up by the drain in this call first, so a
    /// cancellation issued before the next `drain_due` reliably removes
    /// them.
    pub fn cancel(&mut self, source: DeviceId) {
        self.drain_channel();
        self.pending.retain(|e| e.source != source);
    }

    fn drain_channel(&mut self) {
        while let Ok(event) = self.receiver.try_recv() {
            self.pending.push(event);
        }
    }

    /// Pulls every event with `cycle <= current_cycle` out of the bus, in
    /// delivery order (lowest cycle first, ties by registration order).
    pub fn take_due(&mut self, current_cycle: u64) -> Vec<CycleEvent> {
        self.drain_channel();
        self.pending.sort_by_key(|e| (e.cycle, e.seq));
        let split = self.pending.partition_point(|e| e.cycle <= current_cycle);
        self.pending.drain(..split).collect()
    }

    pub fn has_pending(&mut self) -> bool {
        self.drain_channel();
        !self.pending.is_empty()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A cross-thread handle to deposit events onto a [`SignalBus`].
#[derive(Clone)]
pub struct SignalPublisher {
    sender: Sender<CycleEvent>,
}

impl SignalPublisher {
    pub fn publish(&self, cycle: u64, kind: SignalKind, source: DeviceId, seq: u64) {
        let _ = self.sender.send(CycleEvent { cycle, kind, source, seq });
    }
}

/// Drives the CPU, interposing signal delivery at every instruction
/// boundary (spec §4.7: "the CPU runs until a scheduled event fires or an
/// external signal is raised").
pub struct Scheduler {
    pub signals: SignalBus,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            signals: SignalBus::new(),
        }
    }

    /// Steps the CPU until `Halted`/`Stopped`/`InstructionLimit`, delivering
    /// due NMI/IRQ signals from the bus before each step. `Timer` events are
    /// drained but otherwise have no CPU-visible effect; a peripheral
    /// observes them by polling [`SignalBus::take_due`] itself instead.
    pub fn run(&mut self, cpu: &mut Cpu, bus: &mut Bus, devices: &mut DeviceRegistry, instruction_limit: u64) -> StopReason {
        let mut executed = 0u64;
        loop {
            if cpu.stop_requested {
                cpu.stop_requested = false;
                return StopReason::Stopped;
            }
            if executed >= instruction_limit {
                return StopReason::InstructionLimit;
            }

            for event in self.signals.take_due(cpu.cycles) {
                match event.kind {
                    SignalKind::Nmi => cpu.signal_interrupt(InterruptKind::Nmi),
                    SignalKind::Irq => cpu.signal_interrupt(InterruptKind::Irq),
                    SignalKind::Timer => {}
                }
            }

            match cpu.step(bus, devices) {
                Ok(_) => {}
                Err(_) => return StopReason::Halted,
            }
            executed += 1;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_delivered_in_cycle_then_registration_order() {
        let mut bus = SignalBus::new();
        bus.publish(10, SignalKind::Irq, DeviceId(1));
        bus.publish(5, SignalKind::Nmi, DeviceId(2));
        bus.publish(5, SignalKind::Timer, DeviceId(3));

        let due = bus.take_due(10);
        assert_eq!(due.len(), 3);
        assert_eq!(due[0].source, DeviceId(2));
        assert_eq!(due[1].source, DeviceId(3));
        assert_eq!(due[2].source, DeviceId(1));
    }

    #[test]
    fn not_yet_due_events_stay_pending() {
        let mut bus = SignalBus::new();
        bus.publish(100, SignalKind::Irq, DeviceId(1));
        assert!(bus.take_due(50).is_empty());
        assert!(bus.has_pending());
        assert_eq!(bus.take_due(100).len(), 1);
    }

    #[test]
    fn cancel_withdraws_only_the_matching_source() {
        let mut bus = SignalBus::new();
        bus.publish(10, SignalKind::Irq, DeviceId(1));
        bus.publish(10, SignalKind::Nmi, DeviceId(2));
        bus.cancel(DeviceId(1));
        let due = bus.take_due(10);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].source, DeviceId(2));
    }
}

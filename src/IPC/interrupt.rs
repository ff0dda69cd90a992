// Cross-core notification.
// On real silicon `raise` pokes the destination's trigger register; hosted cores ring a
// doorbell word in the arena and sleep on it with a futex.

use crate::Core::arena::Arena;
use crate::Core::futex::futex_wake;
use std::sync::atomic::Ordering;

/// How a sender tells a destination core its ring is non-empty.
pub trait InterruptLine: Send + Sync {
    /// Raise the destination's interrupt. Called after the enqueue, outside the lock.
    fn raise(&self, arena: &Arena, dest_core: u8, trigger_id: u32);
}

/// Doorbell word plus futex wake, for cores that are threads or processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DoorbellLine;

impl InterruptLine for DoorbellLine {
    fn raise(&self, arena: &Arena, dest_core: u8, _trigger_id: u32) {
        let bell = arena.doorbell(dest_core as usize);
        bell.fetch_add(1, Ordering::Release);
        futex_wake(bell);
    }
}

/// Line that never fires; receivers must poll `service_interrupt`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollingLine;

impl InterruptLine for PollingLine {
    fn raise(&self, _arena: &Arena, _dest_core: u8, _trigger_id: u32) {}
}

/// Trigger id a hosted core publishes: its index plus one, so 0 stays "not ready".
pub fn default_trigger_id(core: u8) -> u32 {
    core as u32 + 1
}

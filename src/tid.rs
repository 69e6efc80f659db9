use std::sync::Mutex;

use rand::Rng;

/// Pool of ephemeral local ports handed out as transfer IDs, one per
/// active transfer. Slots are probed at random so freshly released
/// ports are unlikely to be handed out again right away.
#[derive(Debug)]
pub struct TidPool {
    min: u16,
    slots: Mutex<Vec<bool>>,
}

/// How many random probes `acquire` makes before giving up.
const ACQUIRE_ATTEMPTS: usize = 100;

impl TidPool {
    /// Creates a pool over the half-open port range `[min, max)`.
    pub fn new(min: u16, max: u16) -> TidPool {
        TidPool {
            min,
            slots: Mutex::new(vec![false; max.saturating_sub(min) as usize]),
        }
    }

    /// Claims a free TID, or `None` if the probes all landed on busy
    /// slots. A `None` caller should drop the request; the client
    /// will retransmit.
    pub fn acquire(&self) -> Option<u16> {
        let mut slots = self.slots.lock().unwrap();
        if slots.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        for _ in 0..ACQUIRE_ATTEMPTS {
            let n = rng.gen_range(0..slots.len());
            if !slots[n] {
                slots[n] = true;
                return Some(self.min + n as u16);
            }
        }
        None
    }

    pub fn release(&self, tid: u16) {
        let mut slots = self.slots.lock().unwrap();
        let n = (tid - self.min) as usize;
        if let Some(slot) = slots.get_mut(n) {
            *slot = false;
        }
    }
}

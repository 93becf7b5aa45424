//! Frame admission: one frame in flight, minimum spacing between frames.
//!
//! Frames that arrive while another is being processed, or sooner than the
//! throttle interval, are dropped rather than queued.

use std::cell::Cell;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dropped {
    Busy,
    Throttled,
}

#[derive(Debug)]
pub struct FrameGate {
    busy: Cell<bool>,
    last_admitted: Cell<Option<Instant>>,
    min_interval: Duration,
}

/// Held while a frame is processed. Dropping it clears the busy flag on
/// every exit path, including early returns and unwinding.
#[must_use]
pub struct FrameTicket<'a> {
    gate: &'a FrameGate,
}

impl Drop for FrameTicket<'_> {
    fn drop(&mut self) {
        self.gate.busy.set(false);
    }
}

impl FrameGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            busy: Cell::new(false),
            last_admitted: Cell::new(None),
            min_interval,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn set_min_interval(&mut self, min_interval: Duration) {
        self.min_interval = min_interval;
    }

    pub fn is_busy(&self) -> bool {
        self.busy.get()
    }

    pub fn admit(&self, now: Instant) -> Result<FrameTicket<'_>, Dropped> {
        if self.busy.get() {
            return Err(Dropped::Busy);
        }
        if let Some(last) = self.last_admitted.get() {
            if now.saturating_duration_since(last) < self.min_interval {
                return Err(Dropped::Throttled);
            }
        }
        self.busy.set(true);
        self.last_admitted.set(Some(now));
        Ok(FrameTicket { gate: self })
    }

    /// Clear all state, e.g. when the screen is torn down.
    pub fn reset(&self) {
        self.busy.set(false);
        self.last_admitted.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_drops_frames() {
        let gate = FrameGate::new(Duration::ZERO);
        let now = Instant::now();
        let ticket = gate.admit(now).unwrap();
        assert!(gate.is_busy());
        assert_eq!(gate.admit(now).err(), Some(Dropped::Busy));
        drop(ticket);
        assert!(!gate.is_busy());
        assert!(gate.admit(now).is_ok());
    }

    #[test]
    fn test_throttle() {
        let gate = FrameGate::new(Duration::from_millis(300));
        let t0 = Instant::now();
        drop(gate.admit(t0).unwrap());
        assert_eq!(gate.admit(t0 + Duration::from_millis(299)).err(), Some(Dropped::Throttled));
        assert!(gate.admit(t0 + Duration::from_millis(300)).is_ok());
    }

    #[test]
    fn test_busy_cleared_on_unwind() {
        let gate = FrameGate::new(Duration::ZERO);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ticket = gate.admit(Instant::now()).unwrap();
            panic!("frame processing failed");
        }));
        assert!(result.is_err());
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_reset() {
        let gate = FrameGate::new(Duration::from_secs(60));
        let t0 = Instant::now();
        drop(gate.admit(t0).unwrap());
        gate.reset();
        assert!(gate.admit(t0).is_ok());
    }
}

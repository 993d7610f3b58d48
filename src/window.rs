use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::logging::{obj, v_str, warn, Domain};
use crate::store::{Store, END_TIME_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// No deadline configured
    Unbounded,
    Open(Duration),
    Closed,
}

impl WindowState {
    pub fn is_open(&self) -> bool {
        !matches!(self, WindowState::Closed)
    }
}

/// The single optional voting deadline, kept in the settings table.
#[derive(Clone)]
pub struct SessionWindow {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl SessionWindow {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Deadline in epoch milliseconds, if one is set.
    pub fn deadline_ms(&self) -> EngineResult<Option<i64>> {
        let Some(raw) = self.store.get_setting(END_TIME_KEY)? else {
            return Ok(None);
        };
        match raw.trim().parse::<i64>() {
            Ok(ms) => Ok(Some(ms)),
            Err(_) => {
                // unreadable deadline: treat as already passed
                warn(Domain::Window, "bad_deadline", obj(&[("value", v_str(&raw))]));
                Ok(Some(i64::MIN))
            }
        }
    }

    pub fn remaining(&self) -> EngineResult<WindowState> {
        let Some(deadline) = self.deadline_ms()? else {
            return Ok(WindowState::Unbounded);
        };
        let now = self.clock.now_ms();
        if now < deadline {
            Ok(WindowState::Open(Duration::from_millis((deadline - now) as u64)))
        } else {
            Ok(WindowState::Closed)
        }
    }

    pub fn is_open(&self) -> EngineResult<bool> {
        Ok(self.remaining()?.is_open())
    }

    /// Close the window `minutes` from now. Returns the new deadline.
    pub fn set_deadline(&self, minutes: i64) -> EngineResult<i64> {
        if minutes <= 0 {
            return Err(EngineError::InvalidInput(format!("minutes must be positive, got {}", minutes)));
        }
        let deadline = minutes
            .checked_mul(60_000)
            .and_then(|d| self.clock.now_ms().checked_add(d))
            .ok_or_else(|| EngineError::InvalidInput(format!("minutes out of range: {}", minutes)))?;
        self.store.put_setting(END_TIME_KEY, &deadline.to_string())?;
        Ok(deadline)
    }

    /// Set the deadline to now. The setting stays, so the window reads as
    /// closed rather than unbounded.
    pub fn force_close(&self) -> EngineResult<i64> {
        let now = self.clock.now_ms();
        self.store.put_setting(END_TIME_KEY, &now.to_string())?;
        Ok(now)
    }

    /// Drop the deadline entirely; the window is open indefinitely.
    pub fn clear(&self) -> EngineResult<()> {
        self.store.delete_setting(END_TIME_KEY)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn window() -> (Arc<ManualClock>, SessionWindow) {
        let store = Store::open_in_memory().unwrap();
        store.init().unwrap();
        let clock = Arc::new(ManualClock::at_ms(1_000_000));
        (clock.clone(), SessionWindow::new(store, clock))
    }

    #[test]
    fn test_unbounded_by_default() {
        let (_clock, w) = window();
        assert_eq!(w.remaining().unwrap(), WindowState::Unbounded);
        assert!(w.is_open().unwrap());
    }

    #[test]
    fn test_deadline_passes() {
        let (clock, w) = window();
        w.set_deadline(2).unwrap();
        assert_eq!(w.remaining().unwrap(), WindowState::Open(Duration::from_secs(120)));
        clock.advance(chrono::Duration::seconds(119));
        assert!(w.is_open().unwrap());
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(w.remaining().unwrap(), WindowState::Closed);
    }

    #[test]
    fn test_force_close_then_clear() {
        let (_clock, w) = window();
        w.force_close().unwrap();
        assert!(!w.is_open().unwrap());
        assert!(w.deadline_ms().unwrap().is_some());
        w.clear().unwrap();
        assert_eq!(w.remaining().unwrap(), WindowState::Unbounded);
    }

    #[test]
    fn test_rejects_non_positive_minutes() {
        let (_clock, w) = window();
        assert!(matches!(w.set_deadline(0), Err(EngineError::InvalidInput(_))));
        assert!(matches!(w.set_deadline(-5), Err(EngineError::InvalidInput(_))));
    }
}

use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cancel::CancelSignal;
use crate::error::Result;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

pub trait Clock: Send + Sync {
    fn unix_seconds(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}

/// Blocking wait that gives up early once `cancel` is raised.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration, cancel: &CancelSignal) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelSignal) -> Result<()> {
        let mut remaining = duration;
        while !remaining.is_zero() {
            cancel.check()?;
            let step = remaining.min(SLEEP_SLICE);
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        cancel.check()
    }
}

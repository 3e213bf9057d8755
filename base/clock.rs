// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Clock interface and implementations for testability.
//!
//! Recording file names are derived from the wall clock, so anything that
//! opens files takes a `Clocks` implementation rather than calling
//! `jiff::Timestamp::now()` directly.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// Abstract interface to the wall clock.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time.
    fn now(&self) -> jiff::Timestamp;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks;

impl Clocks for RealClocks {
    fn now(&self) -> jiff::Timestamp {
        jiff::Timestamp::now()
    }

    fn sleep(&self, how_long: Duration) {
        std::thread::sleep(how_long);
    }
}

/// Simulated clock for testing.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<Mutex<jiff::Timestamp>>);

impl SimulatedClocks {
    pub fn new(boot: jiff::Timestamp) -> Self {
        SimulatedClocks(Arc::new(Mutex::new(boot)))
    }

    /// Advances the clock by the specified amount without sleeping.
    pub fn advance(&self, how_long: Duration) {
        let d = jiff::SignedDuration::try_from(how_long).expect("duration should be in range");
        let mut l = self.0.lock().unwrap();
        *l = l
            .checked_add(d)
            .expect("simulated clock should not overflow");
    }
}

impl Clocks for SimulatedClocks {
    fn now(&self) -> jiff::Timestamp {
        *self.0.lock().unwrap()
    }

    fn sleep(&self, how_long: Duration) {
        self.advance(how_long);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_advance() {
        let c = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        let before = c.now();
        c.sleep(Duration::from_secs(90));
        assert_eq!((c.now() - before).get_seconds(), 90);
    }
}

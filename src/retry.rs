//! Bounded retry of fallible operations
//!
//! Failures are classified by kind; only the kinds a caller marks as
//! transient are retried.
use std::{fmt, thread, time::Duration};

use log::warn;

/// Errors that can report which kind of failure they are.
pub trait Classify {
    type Kind: PartialEq + fmt::Debug;

    fn kind(&self) -> Self::Kind;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Pause between attempts. Zero retries immediately.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            delay: Duration::from_millis(0),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        RetryPolicy {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Run `op` until it succeeds, fails with a kind not in `transient`, or
    /// has failed `max_retries + 1` times. The last failure is returned.
    pub fn run<T, E, F>(&self, label: &str, transient: &[E::Kind], mut op: F) -> Result<T, E>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let kind = err.kind();
                    if !transient.contains(&kind) || attempt >= self.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    warn!(
                        "{}: retry {} of {} after {:?} failure: {}",
                        label, attempt, self.max_retries, kind, err
                    );
                    if self.delay > Duration::from_millis(0) {
                        thread::sleep(self.delay);
                    }
                }
            }
        }
    }
}

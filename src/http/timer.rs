use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep, sleep};

/// Idle timer for a connection waiting on the first byte of a request.
///
/// A zero duration disables it: `arm` does nothing.
#[derive(Debug)]
pub struct IdleTimer {
    duration: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl IdleTimer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            sleep: None,
        }
    }

    /// Starts the countdown from now, replacing any running one.
    pub fn arm(&mut self) {
        if self.duration.is_zero() {
            return;
        }
        match &mut self.sleep {
            Some(s) => s.as_mut().reset(Instant::now() + self.duration),
            None => self.sleep = Some(Box::pin(sleep(self.duration))),
        }
    }

    /// Stops the countdown. No-op when not armed.
    pub fn cancel(&mut self) {
        self.sleep = None;
    }

    pub fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    /// Completes when the armed countdown runs out; never completes while
    /// disarmed.
    pub async fn expired(&mut self) {
        match &mut self.sleep {
            Some(s) => {
                s.as_mut().await;
                self.sleep = None;
            }
            None => pending::<()>().await,
        }
    }
}

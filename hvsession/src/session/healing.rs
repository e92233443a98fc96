use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ErrorCode, SessionError};

/// The most recent handler failure, as reported to callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    pub code: Option<ErrorCode>,
    pub message: String,
    /// Failures in the current burst.
    pub count: u32,
    pub at: Option<DateTime<Utc>>,
}

/// What the session does about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remedy {
    /// Pass through the error states and resume toward the target.
    Heal,
    /// Give up and clean up.
    Fatal,
}

/// Counts failures that arrive within `window` of each other and gives up
/// once more than `budget` of them pile up.
#[derive(Debug)]
pub struct HealingPolicy {
    window: Duration,
    budget: u32,
    last: Option<Instant>,
    context: ErrorContext,
}

impl HealingPolicy {
    pub fn new(window: Duration, budget: u32) -> Self {
        Self {
            window,
            budget,
            last: None,
            context: ErrorContext::default(),
        }
    }

    pub fn record(&mut self, error: &SessionError) -> Remedy {
        self.record_at(error, Instant::now())
    }

    fn record_at(&mut self, error: &SessionError, now: Instant) -> Remedy {
        let within = self
            .last
            .is_some_and(|last| now.saturating_duration_since(last) < self.window);

        let remedy = if within {
            self.context.count += 1;
            if self.context.count > self.budget {
                Remedy::Fatal
            } else {
                Remedy::Heal
            }
        } else {
            self.context.count = 1;
            Remedy::Heal
        };

        self.last = Some(now);
        self.context.code = Some(error.code);
        self.context.message = error.message.clone();
        self.context.at = Some(Utc::now());
        remedy
    }

    pub fn context(&self) -> ErrorContext {
        self.context.clone()
    }
}

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestrationError, Result};

/// Severity of a cooperative cancellation request, in escalating order.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum InterruptLevel {
    #[default]
    None = 0,
    /// The process is shutting down; hand the job back so it resumes later.
    Retry = 1,
    /// Stop and keep what has been produced so far.
    Finish = 2,
    /// Stop and discard everything.
    Abort = 3,
}

impl InterruptLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => InterruptLevel::Retry,
            2 => InterruptLevel::Finish,
            3 => InterruptLevel::Abort,
            _ => InterruptLevel::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptLevel::None => "none",
            InterruptLevel::Retry => "retry",
            InterruptLevel::Finish => "finish",
            InterruptLevel::Abort => "abort",
        }
    }
}

impl fmt::Display for InterruptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared flag a worker loop raises and a running processor polls.
///
/// Levels only escalate: a `Retry` request cannot downgrade an `Abort`.
#[derive(Clone, Debug, Default)]
pub struct InterruptToken {
    level: Arc<AtomicU8>,
    cancel: CancellationToken,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self, level: InterruptLevel) {
        if level == InterruptLevel::None {
            return;
        }
        self.level.fetch_max(level as u8, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn level(&self) -> InterruptLevel {
        InterruptLevel::from_u8(self.level.load(Ordering::SeqCst))
    }

    pub fn is_interrupted(&self) -> bool {
        self.level() != InterruptLevel::None
    }

    /// Yield point for processors: `Err(Interrupted)` once a request arrived.
    pub fn check(&self) -> Result<()> {
        match self.level() {
            InterruptLevel::None => Ok(()),
            level => Err(OrchestrationError::Interrupted(level)),
        }
    }

    /// Resolves when the first interrupt arrives.
    pub async fn interrupted(&self) -> InterruptLevel {
        self.cancel.cancelled().await;
        self.level()
    }
}

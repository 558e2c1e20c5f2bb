//! Bounded automatic debugging.
//!
//! A [`RetryLoop`] drives a caller-supplied [`Attempt`] through at most
//! `max_tries` tries. Each try starts from a saved conversation branch point
//! and a failed try is rolled back to it before the next one. When every try
//! fails the loop ends with [`PilotError::RetryExhausted`], carrying an
//! [`Escalation`] for whoever has to ask a human.
//!
//! Attempts may run their own nested retry loops with the context they were
//! given. The nesting depth lives in [`RetryContext`] and is checked before
//! each loop starts, so a debugging step that keeps spawning debugging steps
//! stops with [`PilotError::RecursionBudgetExceeded`] instead of recursing
//! forever.
//!
//! ```rust,ignore
//! let retry = RetryLoop::from_config(&config.retry);
//! let mut ctx = RetryContext::new(&mut convo, config.retry.max_depth);
//! match retry.run(&mut ctx, &mut FixFailingTests { runner: &mut runner }).await {
//!     Ok(report) => info!(attempts = report.attempts, "fixed"),
//!     Err(e) => return Err(e), // RetryExhausted -> ask the user
//! }
//! ```

use std::future::Future;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::conversation::ConversationBranch;
use crate::error::PilotError;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of one try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Resolved,
    /// The failure was not resolved; `detail` is the captured output that
    /// describes it (e.g. the failing command's stderr).
    Failed { detail: String },
}

/// Handed upward when automatic retries run out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Escalation {
    pub tries: u32,
    /// Output of the last failed try.
    pub last_failure: Option<String>,
}

/// Returned when a try resolved the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    /// Number of tries made, including the successful one.
    pub attempts: u32,
}

/// Retry loop states. `Attempting` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting(u32),
    Succeeded,
    Exhausted,
}

impl RetryState {
    /// Next state after try `i` of `max_tries` resolved (or not).
    pub fn after_attempt(i: u32, resolved: bool, max_tries: u32) -> Self {
        if resolved {
            Self::Succeeded
        } else if i < max_tries {
            Self::Attempting(i + 1)
        } else {
            Self::Exhausted
        }
    }
}

// ---------------------------------------------------------------------------
// RetryContext
// ---------------------------------------------------------------------------

/// State threaded through every try, including tries of nested loops.
pub struct RetryContext<'c> {
    pub conversation: &'c mut ConversationBranch,
    depth: u32,
    max_depth: u32,
    attempt: u32,
}

impl<'c> RetryContext<'c> {
    /// Context for a top-level caller: no retry loop is active yet.
    pub fn new(conversation: &'c mut ConversationBranch, max_depth: u32) -> Self {
        Self {
            conversation,
            depth: 0,
            max_depth,
            attempt: 0,
        }
    }

    /// Number of retry loops currently running around the caller.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// 1-based try number of the innermost running loop (0 outside any loop).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// ---------------------------------------------------------------------------
// Attempt
// ---------------------------------------------------------------------------

/// One strategy for resolving a failure, invoked once per try.
pub trait Attempt {
    /// Errors abort the loop immediately; they are not retried.
    type Error: From<PilotError>;

    fn attempt(
        &mut self,
        ctx: &mut RetryContext<'_>,
    ) -> impl Future<Output = Result<AttemptOutcome, Self::Error>> + Send;
}

// ---------------------------------------------------------------------------
// RetryLoop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RetryLoop {
    max_tries: u32,
}

impl RetryLoop {
    /// A loop making at most `max_tries` tries (at least one).
    pub fn new(max_tries: u32) -> Self {
        Self {
            max_tries: max_tries.max(1),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_tries)
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// Drive `attempt` until it resolves or the tries run out.
    ///
    /// The conversation is rolled back to the state it had when each try
    /// began whenever that try fails or errors; a resolving try keeps its
    /// messages.
    pub async fn run<A: Attempt>(
        &self,
        ctx: &mut RetryContext<'_>,
        attempt: &mut A,
    ) -> Result<RetryReport, A::Error> {
        let depth = ctx.depth + 1;
        if depth > ctx.max_depth {
            warn!(depth, limit = ctx.max_depth, "nested retry budget exceeded");
            return Err(PilotError::RecursionBudgetExceeded {
                depth,
                limit: ctx.max_depth,
            }
            .into());
        }

        let outer_attempt = ctx.attempt;
        ctx.depth = depth;
        let result = self.drive(ctx, attempt).await;
        ctx.depth = depth - 1;
        ctx.attempt = outer_attempt;
        result
    }

    async fn drive<A: Attempt>(
        &self,
        ctx: &mut RetryContext<'_>,
        attempt: &mut A,
    ) -> Result<RetryReport, A::Error> {
        let mut state = RetryState::Attempting(1);
        let mut last_failure = None;
        loop {
            match state {
                RetryState::Attempting(i) => {
                    ctx.attempt = i;
                    let branch = ctx.conversation.save_branch();
                    debug!(attempt = i, max = self.max_tries, depth = ctx.depth, "retry attempt");

                    let outcome = match attempt.attempt(ctx).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            ctx.conversation.load_branch(branch)?;
                            ctx.conversation.drop_branch(branch);
                            return Err(e);
                        }
                    };

                    let resolved = match outcome {
                        AttemptOutcome::Resolved => true,
                        AttemptOutcome::Failed { detail } => {
                            ctx.conversation.load_branch(branch)?;
                            last_failure = Some(detail);
                            false
                        }
                    };
                    ctx.conversation.drop_branch(branch);
                    state = RetryState::after_attempt(i, resolved, self.max_tries);
                }
                RetryState::Succeeded => {
                    info!(attempts = ctx.attempt, depth = ctx.depth, "retry loop resolved");
                    return Ok(RetryReport {
                        attempts: ctx.attempt,
                    });
                }
                RetryState::Exhausted => {
                    warn!(tries = self.max_tries, depth = ctx.depth, "automatic retries exhausted");
                    return Err(PilotError::RetryExhausted(Escalation {
                        tries: self.max_tries,
                        last_failure,
                    })
                    .into());
                }
            }
        }
    }
}

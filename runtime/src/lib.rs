//! # Careslot Runtime
//!
//! Runtime pieces that sit between the pure reducers in `careslot-core` and
//! the outside world.
//!
//! ## Core Components
//!
//! - **Effect executor**: Runs effect descriptions and collects the actions they feed back
//! - **Retry**: Exponential backoff policy, used both inline and for durable work items
//! - **Periodic runner**: Drives a [`periodic::PeriodicTask`] on a fixed cadence until shutdown
//!
//! ## Example
//!
//! ```ignore
//! use careslot_runtime::execute_effects;
//!
//! let effects = reducer.reduce(&mut state, action, &env);
//! persist(&state).await?;
//! for feedback in execute_effects(effects).await {
//!     reducer.reduce(&mut state, feedback, &env);
//! }
//! ```

use careslot_core::effect::Effect;
use futures::future::{BoxFuture, FutureExt, join_all};

/// Retry logic with exponential backoff
pub mod retry;

/// Periodic task runner with graceful shutdown
pub mod periodic;

pub use periodic::{PeriodicHandle, PeriodicRunner, PeriodicTask};
pub use retry::{RetryPolicy, retry_with_backoff};

/// Error types for the runtime
pub mod error {
    use thiserror::Error;

    /// Errors raised by runtime components
    #[derive(Error, Debug)]
    pub enum RunnerError {
        /// Shutdown timed out waiting for the task loop to finish
        #[error("Periodic task '{0}' did not stop within the shutdown timeout")]
        ShutdownTimeout(String),

        /// The task loop panicked or was aborted
        #[error("Periodic task join error: {0}")]
        TaskJoinError(#[from] tokio::task::JoinError),
    }
}

pub use error::RunnerError;

/// Execute a batch of effects and collect every action they feed back.
///
/// Top-level effects run in order. `Parallel` children run concurrently and
/// their actions are returned in declaration order; `Sequential` children run
/// one after another. Feedback actions are returned rather than dispatched so
/// the caller decides how (and whether) to reduce and persist them.
pub async fn execute_effects<A, I>(effects: I) -> Vec<A>
where
    A: Send + 'static,
    I: IntoIterator<Item = Effect<A>>,
{
    let mut actions = Vec::new();
    for effect in effects {
        actions.extend(execute(effect).await);
    }
    actions
}

fn execute<A>(effect: Effect<A>) -> BoxFuture<'static, Vec<A>>
where
    A: Send + 'static,
{
    async move {
        match effect {
            Effect::None => Vec::new(),
            Effect::Future(future) => future.await.into_iter().collect(),
            Effect::Sequential(effects) => {
                let mut actions = Vec::new();
                for effect in effects {
                    actions.extend(execute(effect).await);
                }
                actions
            },
            Effect::Parallel(effects) => {
                let results = join_all(effects.into_iter().map(execute)).await;
                results.into_iter().flatten().collect()
            },
        }
    }
    .boxed()
}

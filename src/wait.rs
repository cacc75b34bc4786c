//! Bounded retry/poll primitive
//!
//! One poll loop, parameterised by a [`Schedule`], waits for every
//! asynchronous provider transition: volume availability, attachment state
//! and resize modifications.

use crate::context::OpContext;
use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

// =============================================================================
// Schedules
// =============================================================================

/// How often and for how long a condition is rechecked
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Schedule {
    /// Check up to `steps` times, sleeping `initial * factor^n` between checks
    Exponential {
        initial: Duration,
        factor: f64,
        steps: u32,
    },
    /// Sleep `interval` before every check until `timeout` has elapsed
    Fixed { interval: Duration, timeout: Duration },
}

/// Attach/detach convergence. Most transitions finish within 1-4 seconds;
/// the waits grow as 1, 1.8, 3.24, 5.83, 10.5, ...
pub const ATTACHMENT_BACKOFF: Schedule = Schedule::Exponential {
    initial: Duration::from_secs(1),
    factor: 1.8,
    steps: 13,
};

/// Resize modification convergence
pub const MODIFICATION_BACKOFF: Schedule = Schedule::Exponential {
    initial: Duration::from_secs(1),
    factor: 1.8,
    steps: 20,
};

/// Freshly created volume becoming "available"; usually about 4 seconds
pub const VOLUME_AVAILABLE_POLL: Schedule = Schedule::Fixed {
    interval: Duration::from_secs(3),
    timeout: Duration::from_secs(60),
};

// =============================================================================
// Poll Loop
// =============================================================================

/// Run `condition` on `schedule` until it yields a value.
///
/// * `Ok(Some(v))` ends the loop with `v`.
/// * `Err(e)` ends the loop immediately with `e`; nothing is retried.
/// * An exhausted schedule fails with [`Error::Timeout`].
/// * A cancelled context or a passed deadline fails with
///   [`Error::Cancelled`] / [`Error::DeadlineExceeded`], detected before
///   every check and during every sleep.
pub async fn poll<T, F, Fut>(
    ctx: &OpContext,
    operation: &str,
    schedule: &Schedule,
    mut condition: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();

    match *schedule {
        Schedule::Exponential {
            initial,
            factor,
            steps,
        } => {
            let mut delay = initial;
            for attempt in 1..=steps {
                ctx.check(operation)?;
                if let Some(value) = condition().await? {
                    return Ok(value);
                }
                if attempt == steps {
                    break;
                }
                debug!(
                    "{}: not ready after attempt {}/{}, retrying in {:?}",
                    operation, attempt, steps, delay
                );
                ctx.sleep(operation, delay).await?;
                delay = Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay);
            }
            Err(Error::Timeout {
                operation: operation.to_string(),
                attempts: steps,
                waited: started.elapsed(),
            })
        }
        Schedule::Fixed { interval, timeout } => {
            let mut attempts = 0u32;
            loop {
                ctx.sleep(operation, interval).await?;
                ctx.check(operation)?;
                attempts += 1;
                if let Some(value) = condition().await? {
                    return Ok(value);
                }
                if started.elapsed() >= timeout {
                    return Err(Error::Timeout {
                        operation: operation.to_string(),
                        attempts,
                        waited: started.elapsed(),
                    });
                }
                debug!("{}: not ready after {:?}", operation, started.elapsed());
            }
        }
    }
}

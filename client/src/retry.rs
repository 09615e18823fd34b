//! Async drivers for schedules: retry failing operations, repeat succeeding
//! ones.

use std::future::Future;
use std::time::Duration;

use crate::schedule::{Next, Schedule, ScheduleDeps};

/// Run `op` until it succeeds, stepping `schedule` with each error.
///
/// The schedule decides whether (and after how long) to try again; when it
/// completes, the last error is returned.
pub async fn retry<T, E, O, Fut>(
    deps: &ScheduleDeps,
    schedule: &Schedule<E, O>,
    mut op: impl FnMut() -> Fut,
) -> Result<T, E>
where
    E: 'static,
    O: 'static,
    Fut: Future<Output = Result<T, E>>,
{
    let mut step = schedule.step(deps);
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => match step(&error) {
                Next::Continue { delay, .. } => {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Next::Done => return Err(error),
            },
        }
    }
}

/// Run `op` repeatedly, stepping `schedule` with each result, until the
/// schedule completes or `op` fails. Returns the last successful value.
pub async fn repeat<T, E, O, Fut>(
    deps: &ScheduleDeps,
    schedule: &Schedule<T, O>,
    mut op: impl FnMut() -> Fut,
) -> Result<T, E>
where
    T: 'static,
    O: 'static,
    Fut: Future<Output = Result<T, E>>,
{
    let mut step = schedule.step(deps);
    loop {
        let value = op().await?;
        match step(&value) {
            Next::Continue { delay, .. } => {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Next::Done => return Ok(value),
        }
    }
}

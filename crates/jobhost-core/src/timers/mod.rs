//! Background timing: serial task series, delay strategies and the channel
//! for errors raised by background work.

mod delay;
mod exceptions;
mod task_series;

pub use delay::{
    DelayStrategy, FixedDelayStrategy, LinearSpeedupStrategy,
    RandomizedExponentialBackoffStrategy,
};
pub use exceptions::{BackgroundExceptionHandler, HostExceptionHandler};
pub use task_series::{TaskSeriesCommand, TaskSeriesCommandResult, TaskSeriesTimer, WaitFuture};

mod jobs;
mod schedule;

pub use jobs::{JobCallback, JobHandle, Scheduler};
pub use schedule::{Schedule, next_run};

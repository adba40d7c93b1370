mod engine;
mod window;

pub use engine::{ReconcileEngine, SweepEnd, SweepOutcome, WindowCloseOutcome};
pub use window::{AttendanceWindow, DayWindow, MatchMode};

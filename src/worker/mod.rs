//! Worker lifecycle: durable deferred work for a terminable worker.
//!
//! Core components:
//! - `clock`: wall-clock source (system or manual)
//! - `timer`: named, replaceable wake alarms
//! - `task`: persisted task records and the handler trait
//! - `state`: scheduler phase (Idle → Armed → Firing)
//! - `scheduler`: ordered durable queue driven by one alarm

pub mod clock;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use scheduler::{FireReport, PENDING_TASKS_KEY, Scheduler};
pub use state::SchedulerPhase;
pub use task::{Task, TaskHandler, insert_ordered};
pub use timer::{ManualWakeTimer, TokioWakeTimer, WakeTimer};

//! The reconciliation engine: window planning, sum tracking, per-account
//! guards, the cycle coordinator and its schedule.

pub mod coordinator;
pub mod guard;
pub mod scheduler;
pub mod sum_tracker;
pub mod window;

#[cfg(test)]
pub(crate) mod test_support;

pub use coordinator::{
    AccountRuntime, CoordinatorSettings, CycleOutcome, CycleReport, MeterReport, ReconciliationCoordinator,
};
pub use guard::{AccountGuard, CycleKind, CyclePermit, GuardState};
pub use scheduler::spawn_account_schedules;
pub use sum_tracker::{SumMode, SumTracker, TrackOutcome};
pub use window::{policy_for, FetchWindow, PlannerState, WindowPlanner, WindowPolicy, WindowSpan, WINDOW_POLICY};

pub mod policy;
mod scheduler;

pub use policy::{CleanPolicy, HeuristicPolicy, ScanPolicy, ScriptedPolicy, Verdict};
pub use scheduler::{ManualScan, ScanHandle, ScanScheduler, SchedulerState};

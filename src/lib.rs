//! Punchclock: move a run of git commits onto working hours.
//!
//! Punchclock re-dates the last N commits of a branch (or its whole history)
//! so they fall on weekdays between configurable office hours inside a chosen
//! calendar window. Trees, messages and the shape of the chain are kept; only
//! the dates, and optionally the identity, change.
//!
//! # Architecture
//!
//! - **Schedule**: Draw sorted, jittered work-hours timestamps
//! - **Commit**: Read and write git commit objects
//! - **Git**: The repository seam and its `git` executable implementation
//! - **Rewrite**: Re-chain the commits onto the new timestamps and move the branch
//! - **Config**: Optional settings file

pub mod commit;
pub mod config;
pub mod git;
pub mod rewrite;
pub mod schedule;

pub use commit::{CommitRecord, IdentityOverride, Signature};
pub use config::Config;
pub use git::{CommitRange, Git, HeadRef, Repository};
pub use rewrite::{
    PlanEntry, Progress, RewriteRequest, Rewritten, backup_name, plan, rewrite, select_commits,
};
pub use schedule::{DateWindow, RandomSource, ScheduleRequest, Timestamp, WorkHours, generate};

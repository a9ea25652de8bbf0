//! Run sessions and their coordination.
//!
//! Provides:
//! - `OutputAggregator` - Ordered, gap-checked output buffer for one run
//! - `RunSession` - One submitted run and its status
//! - `RunHistory` - Bounded record of retired runs
//! - `SessionCoordinator` - Supersede-on-submit routing of backend output

pub mod aggregator;
pub mod coordinator;
pub mod history;
pub mod run;

pub use aggregator::{AppendOutcome, OutputAggregator};
pub use coordinator::{CoordinatorConfig, CoordinatorEvent, SessionCoordinator};
pub use history::RunHistory;
pub use run::{RunSession, RunSnapshot};

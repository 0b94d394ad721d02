//! Progress reporting collaborator
//!
//! Observational only: nothing in the orchestration depends on what a sink
//! does with the messages.

use std::fmt::Debug;
use tracing::{debug, info};

/// Receiver of status and progress messages
pub trait ProgressSink: Send + Sync + Debug {
    /// Push a status line, e.g. "Recovering Stress"
    fn push_status(&self, status: &str);

    /// Pop the most recent status line
    fn pop_status(&self);

    /// Name the item currently worked on, e.g. an FE file
    fn set_sub_task(&self, task: &str);

    /// Add a line to the user-visible output list
    fn list(&self, message: &str);
}

/// [`ProgressSink`] that forwards everything to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn push_status(&self, status: &str) {
        debug!(status, "status pushed");
    }

    fn pop_status(&self) {
        debug!("status popped");
    }

    fn set_sub_task(&self, task: &str) {
        debug!(task, "sub-task");
    }

    fn list(&self, message: &str) {
        info!("{message}");
    }
}

//! Single-slot controller for the active speech operation.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::errors::SpeechError;

pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of the active operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Start,
    Streaming,
    End,
    Cancelled,
    Error,
}

impl OpStatus {
    /// Terminal states free the slot once their poll result is consumed.
    pub fn is_terminal(self) -> bool {
        matches!(self, OpStatus::End | OpStatus::Cancelled | OpStatus::Error)
    }
}

/// The in-memory record of the currently active session.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: i32,
    pub status: OpStatus,
    pub error: Option<SpeechError>,
}

/// Tracks at most one [`Operation`] and its soft response deadline.
///
/// The deadline is armed by [`refresh_deadline`](Self::refresh_deadline)
/// when the final protocol message of a request has been handed to the
/// transport; before that the receiver waits without bound. Waiting for
/// status changes is done by the engine, which owns the condition this
/// controller's transitions are signalled on.
#[derive(Debug)]
pub struct OperationController {
    op: Option<Operation>,
    deadline: Option<Instant>,
    timeout: Duration,
}

impl OperationController {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_OP_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            op: None,
            deadline: None,
            timeout,
        }
    }

    /// Install a new operation. The slot must be empty.
    pub fn new_op(&mut self, id: i32, status: OpStatus) {
        debug_assert!(self.op.is_none(), "operation slot already occupied");
        debug!(id, ?status, "new operation");
        self.deadline = None;
        self.op = Some(Operation {
            id,
            status,
            error: None,
        });
    }

    pub fn current(&self) -> Option<&Operation> {
        self.op.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Operation> {
        self.op.as_mut()
    }

    /// Attach a failure to the operation. No effect on terminal states, so
    /// a late transport error cannot overwrite a finished session.
    pub fn set_error(&mut self, err: SpeechError) {
        if let Some(op) = &mut self.op {
            if !op.status.is_terminal() {
                debug!(id = op.id, ?err, "operation failed");
                op.status = OpStatus::Error;
                op.error = Some(err);
            }
        }
    }

    /// Flip the operation to CANCELLED. `id == 0` matches any; a terminal
    /// operation is left alone (cancelling a finished session is a no-op).
    pub fn cancel(&mut self, id: i32) -> bool {
        match &mut self.op {
            Some(op) if (id == 0 || op.id == id) && !op.status.is_terminal() => {
                debug!(id = op.id, "operation cancelled");
                op.status = OpStatus::Cancelled;
                true
            }
            _ => false,
        }
    }

    /// Mark the operation finished (server sent its final response).
    pub fn finish(&mut self) {
        if let Some(op) = &mut self.op {
            if !op.status.is_terminal() {
                op.status = OpStatus::End;
            }
        }
    }

    /// Free the slot. Required before another `new_op`.
    pub fn remove(&mut self) {
        self.op = None;
        self.deadline = None;
    }

    /// Arm the response deadline.
    pub fn refresh_deadline(&mut self) {
        self.deadline = Some(Instant::now() + self.timeout);
    }

    /// Remaining time before the active operation expires. `None` means
    /// wait without bound: no operation, no deadline armed yet, or the
    /// operation is already terminal and merely awaits consumption.
    pub fn remaining_timeout(&self) -> Option<Duration> {
        let op = self.op.as_ref()?;
        if op.status.is_terminal() {
            return None;
        }
        self.deadline
            .map(|deadline| deadline.duration_since(Instant::now()))
    }

    /// True when a deadline is armed and has elapsed.
    pub fn expired(&self) -> bool {
        matches!(self.remaining_timeout(), Some(left) if left.is_zero())
    }
}

impl Default for OperationController {
    fn default() -> Self {
        Self::new()
    }
}

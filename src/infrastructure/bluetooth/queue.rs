//! Operation Queue
//!
//! Per-connection FIFO of radio operations. At most one operation is in
//! flight; the next one is only handed out once the in-flight operation
//! has completed and its outcome has been delivered ([`OperationQueue::settled`]).
//! The queue holds no lock of its own; the owning connection guards it.

use crate::infrastructure::bluetooth::error::OperationError;
use crate::infrastructure::bluetooth::gatt::{Operation, OperationId, Request, Response};
use std::collections::VecDeque;
use tokio::sync::oneshot;

pub type OperationResult = Result<Response, OperationError>;

/// Receives the outcome of one submitted operation.
pub type Continuation = oneshot::Sender<OperationResult>;

#[derive(Debug)]
pub struct QueuedOperation {
    pub id: OperationId,
    pub operation: Operation,
    continuation: Option<Continuation>,
}

impl QueuedOperation {
    pub fn new(id: OperationId, operation: Operation, continuation: Option<Continuation>) -> Self {
        Self {
            id,
            operation,
            continuation,
        }
    }

    /// Notify the continuation. Consumes the operation so it happens once.
    pub fn finish(self, result: OperationResult) {
        if let Some(continuation) = self.continuation {
            // The submitter may have stopped listening.
            let _ = continuation.send(result);
        }
    }
}

/// What [`OperationQueue::advance`] decided.
#[derive(Debug, Default)]
pub struct Advance {
    /// The operation that just went in flight, to hand to the transport.
    pub start: Option<(OperationId, Request)>,
    /// Operations that failed validation, in queue order.
    pub rejected: Vec<(QueuedOperation, OperationError)>,
}

#[derive(Debug, Default)]
pub struct OperationQueue {
    pending: VecDeque<QueuedOperation>,
    in_flight: Option<QueuedOperation>,
    /// A completed operation whose outcome is still being delivered.
    settling: bool,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: QueuedOperation) {
        self.pending.push_back(op);
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some() || self.settling
    }

    pub fn in_flight(&self) -> Option<&QueuedOperation> {
        self.in_flight.as_ref()
    }

    /// Pending plus in-flight operations.
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Put the next operation in flight if the queue is idle.
    ///
    /// `validate` turns an operation into a transport request; operations
    /// it rejects are removed and returned so the caller can fail them
    /// after releasing its lock.
    pub fn advance<F>(&mut self, mut validate: F) -> Advance
    where
        F: FnMut(&Operation) -> Result<Request, OperationError>,
    {
        let mut advance = Advance::default();
        if self.is_busy() {
            return advance;
        }

        while let Some(op) = self.pending.pop_front() {
            match validate(&op.operation) {
                Ok(request) => {
                    advance.start = Some((op.id, request));
                    self.in_flight = Some(op);
                    break;
                }
                Err(e) => advance.rejected.push((op, e)),
            }
        }
        advance
    }

    /// Take the in-flight operation if `id` names it. The queue stays busy
    /// until [`settled`](Self::settled) is called.
    pub fn complete(&mut self, id: OperationId) -> Option<QueuedOperation> {
        match &self.in_flight {
            Some(op) if op.id == id => {
                self.settling = true;
                self.in_flight.take()
            }
            _ => None,
        }
    }

    /// The last completed operation's outcome has been delivered.
    pub fn settled(&mut self) {
        self.settling = false;
    }

    /// Empty the queue, in-flight operation first.
    pub fn drain(&mut self) -> Vec<QueuedOperation> {
        self.settling = false;
        self.in_flight
            .take()
            .into_iter()
            .chain(self.pending.drain(..))
            .collect()
    }
}

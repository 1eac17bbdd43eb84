//! Single-slot queue for deferred wire operations.
//!
//! Preparing and deallocating statements does not need to block the caller
//! that triggered it. The request is issued here, written to the channel once
//! the current response has been read, and its own response is collected by
//! whoever next needs the channel.

use tracing::{debug, trace};

use super::channel::{Request, WireChannel, WireResponse};
use super::error::{PgError, PgResult};

struct PendingOperation<T> {
    request: Request,
    completion: T,
    sent: bool,
}

/// At most one deferred operation per connection.
///
/// `T` is the completion handed back with the operation's outcome when it is
/// drained.
pub struct PendingOperationQueue<T> {
    pending: Option<PendingOperation<T>>,
    /// Responses of discarded operations that are still on the wire.
    unread: usize,
}

impl<T> Default for PendingOperationQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingOperationQueue<T> {
    pub fn new() -> Self {
        Self {
            pending: None,
            unread: 0,
        }
    }

    /// Whether no operation is pending.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Whether the pending operation has been written and awaits its response.
    pub fn in_flight(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| p.sent) || self.unread > 0
    }

    pub fn request(&self) -> Option<&Request> {
        self.pending.as_ref().map(|p| &p.request)
    }

    /// Register a deferred operation. Fails while another one is pending.
    pub fn issue(&mut self, request: Request, completion: T) -> PgResult<()> {
        if let Some(current) = &self.pending {
            return Err(PgError::OperationInProgress(current.request.sql()));
        }
        trace!(request = %request.sql(), "pending operation issued");
        self.pending = Some(PendingOperation {
            request,
            completion,
            sent: false,
        });
        Ok(())
    }

    /// Write the pending request, if any and not yet written.
    ///
    /// A request that cannot be written is dropped from the queue and its
    /// completion is handed back with the error.
    pub async fn send<C: WireChannel>(&mut self, channel: &mut C) -> Result<bool, (T, PgError)> {
        self.resync(channel).await;
        let Some(pending) = self.pending.as_mut() else {
            return Ok(false);
        };
        if pending.sent {
            return Ok(false);
        }
        if let Err(e) = channel.send(&pending.request).await {
            debug!(request = %pending.request.sql(), error = %e, "pending operation not sent");
            return match self.pending.take() {
                Some(unsent) => Err((unsent.completion, e)),
                None => Ok(false),
            };
        }
        pending.sent = true;
        Ok(true)
    }

    /// Wait for the pending operation to finish and hand back its completion
    /// with the server's answer. `Ok(None)` when nothing was pending.
    ///
    /// The outer error is a transport failure; the inner result is the
    /// operation's own outcome, including a failure to write it.
    pub async fn drain<C: WireChannel>(
        &mut self,
        channel: &mut C,
    ) -> PgResult<Option<(T, PgResult<WireResponse>)>> {
        if self.pending.is_none() {
            self.resync(channel).await;
            return Ok(None);
        }
        if let Err((completion, e)) = self.send(channel).await {
            return Ok(Some((completion, Err(e))));
        }
        let Some(pending) = self.pending.take() else {
            return Ok(None);
        };
        let outcome = channel.receive().await;
        match &outcome {
            Ok(_) => trace!(request = %pending.request.sql(), "pending operation finished"),
            Err(e) => debug!(request = %pending.request.sql(), error = %e, "pending operation failed"),
        }
        Ok(Some((pending.completion, outcome)))
    }

    /// Abandon the pending operation without running its completion.
    ///
    /// If it was already written, its response is skipped before the channel
    /// is used again.
    pub fn discard(&mut self) -> Option<Request> {
        let pending = self.pending.take()?;
        if pending.sent {
            self.unread += 1;
        }
        trace!(request = %pending.request.sql(), "pending operation discarded");
        Some(pending.request)
    }

    async fn resync<C: WireChannel>(&mut self, channel: &mut C) {
        while self.unread > 0 {
            self.unread -= 1;
            if let Err(e) = channel.receive().await {
                debug!(error = %e, "discarded operation failed");
            }
        }
    }
}

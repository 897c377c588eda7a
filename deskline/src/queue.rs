//! Outbound message queue.
//!
//! Messages that could not be handed to the channel are buffered here and
//! replayed, oldest first, once the channel opens again. Flushing removes
//! a message as soon as the channel accepts it; that is not a server
//! acknowledgment.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;

use chrono::{DateTime, Utc};
use deskline_proto::frame::{OutboundFrame, SendMessageFrame};
use deskline_proto::message::{MessageId, SenderRole, SessionId, UserId};
use parking_lot::Mutex;

/// A message waiting for the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Target session.
    pub session_id: SessionId,
    /// Message text.
    pub content: String,
    /// Role of the sending surface.
    pub sender_role: SenderRole,
    /// Intended receiver, when known.
    pub receiver_id: Option<UserId>,
    /// Temporary ID of the matching optimistic message.
    pub temp_id: MessageId,
    /// When the message entered the queue.
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    /// Creates a queue entry stamped with the current time.
    pub fn new(
        session_id: SessionId,
        content: impl Into<String>,
        sender_role: SenderRole,
        receiver_id: Option<UserId>,
        temp_id: MessageId,
    ) -> Self {
        Self {
            session_id,
            content: content.into(),
            sender_role,
            receiver_id,
            temp_id,
            enqueued_at: Utc::now(),
        }
    }

    /// Builds the `send_message` frame for this entry.
    #[must_use]
    pub fn to_frame(&self) -> OutboundFrame {
        OutboundFrame::SendMessage(SendMessageFrame {
            session_id: self.session_id.clone(),
            content: self.content.clone(),
            sender: self.sender_role,
            receiver_id: self.receiver_id.clone(),
            timestamp: self.enqueued_at,
            temp_id: Some(self.temp_id.clone()),
        })
    }
}

/// Outcome of a [`MessageQueue::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries taken from the queue.
    pub attempted: usize,
    /// Entries the sender accepted.
    pub sent: usize,
    /// Entries appended back after a failed send.
    pub requeued: usize,
}

/// Unbounded FIFO of outbound messages.
#[derive(Debug, Default)]
pub struct MessageQueue {
    entries: Mutex<VecDeque<QueuedMessage>>,
}

impl MessageQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message to the tail.
    pub fn enqueue(&self, message: QueuedMessage) {
        let mut entries = self.entries.lock();
        tracing::info!(
            session_id = %message.session_id,
            temp_id = %message.temp_id,
            queue_len = entries.len() + 1,
            "message queued for delivery"
        );
        entries.push_back(message);
    }

    /// Sends every queued message through `send`, oldest first.
    ///
    /// The queue is emptied before the first send, so messages enqueued
    /// while the flush runs are not part of it. A message whose send fails
    /// is appended to the tail again and may end up behind those newer
    /// messages.
    pub async fn flush<F, Fut, E>(&self, mut send: F) -> FlushReport
    where
        F: FnMut(&QueuedMessage) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let batch: Vec<QueuedMessage> = self.entries.lock().drain(..).collect();
        let mut report = FlushReport {
            attempted: batch.len(),
            ..FlushReport::default()
        };

        for message in batch {
            match send(&message).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    tracing::warn!(
                        temp_id = %message.temp_id,
                        error = %e,
                        "flush send failed, re-queuing"
                    );
                    self.entries.lock().push_back(message);
                    report.requeued += 1;
                }
            }
        }

        if report.attempted > 0 {
            tracing::info!(
                sent = report.sent,
                requeued = report.requeued,
                "flushed message queue"
            );
        }
        report
    }

    /// Removes the entry for the optimistic message `temp_id`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove_by_temp_id(&self, temp_id: &MessageId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|m| m.temp_id != *temp_id);
        before != entries.len()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of the queued messages, oldest first.
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.entries.lock().iter().cloned().collect()
    }
}

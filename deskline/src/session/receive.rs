//! Inbound path: pushed messages, channel acks and channel errors.

use deskline_proto::frame::{MessageErrorFrame, MessageSentFrame, NewMessageFrame};
use deskline_proto::message::{MessageId, SessionId};

use super::{ChatSessionController, SessionEvent};
use crate::api::SessionApi;
use crate::transport::Transport;

impl<T: Transport, A: SessionApi> ChatSessionController<T, A> {
    /// Applies a `new_message` frame.
    ///
    /// A message for the open session is appended, unless a message with
    /// the same ID is already there, in which case only its read flag is
    /// merged. An unread counterpart message flags a read receipt as due.
    /// A message for any other session bumps that session's unread count,
    /// creating a summary if the session is not listed yet.
    pub fn handle_new_message(&self, frame: &NewMessageFrame) {
        let NewMessageFrame {
            session_id,
            message,
        } = frame;
        let counterpart = self.surface.is_counterpart(message.sender);
        let mut events = Vec::new();

        let mut state = self.state.lock();
        if state.is_open(session_id) {
            let mut appended = false;
            if let Some(open) = state.open_mut(session_id) {
                match open.position_of(&message.id) {
                    Some(pos) => open.messages[pos].merge_read(message.read),
                    None => {
                        open.messages.push(message.clone());
                        if counterpart && !message.read {
                            open.unread_count += 1;
                        }
                        appended = true;
                    }
                }
            }
            if appended {
                state.sync_summary(session_id);
                events.push(SessionEvent::MessageAppended {
                    session_id: session_id.clone(),
                    message: message.clone(),
                });
                if counterpart && !message.read {
                    state.read_receipt_due = true;
                    events.push(SessionEvent::ReadReceiptDue {
                        session_id: session_id.clone(),
                    });
                }
            } else {
                tracing::debug!(message_id = %message.id, "duplicate inbound message merged");
            }
        } else {
            let summary = state.summary_entry(session_id);
            summary.last_message = Some(message.clone());
            if counterpart {
                summary.unread_count += 1;
                events.push(SessionEvent::UnreadChanged {
                    session_id: session_id.clone(),
                    unread_count: summary.unread_count,
                });
            }
        }
        drop(state);

        tracing::debug!(
            surface = %self.surface,
            session_id = %session_id,
            message_id = %message.id,
            "inbound message applied"
        );
        self.emit_all(events);
    }

    /// Applies a `message_sent` ack by reconciling its temporary ID.
    pub fn handle_message_sent(&self, frame: &MessageSentFrame) {
        let Some(temp_id) = &frame.temp_id else {
            tracing::debug!(message_id = %frame.message_id, "ack without temporary ID ignored");
            return;
        };
        self.reconcile_temp_id(&frame.session_id, temp_id, &frame.message_id);
    }

    /// Reports a `message_error` frame to the UI.
    ///
    /// The REST leg of the send decides whether the message survives, so
    /// nothing is rolled back here.
    pub fn handle_message_error(&self, frame: &MessageErrorFrame) {
        let error = frame
            .error
            .clone()
            .unwrap_or_else(|| "message rejected".to_string());
        tracing::warn!(
            surface = %self.surface,
            temp_id = ?frame.temp_id,
            error = %error,
            "server rejected channel message"
        );
        self.emit(SessionEvent::DeliveryError {
            session_id: frame.session_id.clone(),
            temp_id: frame.temp_id.clone(),
            error,
        });
    }

    /// Replaces `temp_id` with `message_id` in session `session_id`.
    ///
    /// The message keeps its position in the open session. If a message
    /// with `message_id` is already present it is folded into the
    /// reconciled one instead of being kept twice. A summary whose last
    /// message is `temp_id` is updated too.
    ///
    /// Returns `true` if anything changed.
    pub fn reconcile_temp_id(
        &self,
        session_id: &SessionId,
        temp_id: &MessageId,
        message_id: &MessageId,
    ) -> bool {
        let mut state = self.state.lock();
        let mut changed = false;

        if let Some(open) = state.open_mut(session_id)
            && let Some(mut pos) = open.position_of(temp_id)
        {
            if let Some(dup) = open.position_of(message_id) {
                let duplicate = open.messages.remove(dup);
                if dup < pos {
                    pos -= 1;
                }
                open.messages[pos].merge_read(duplicate.read);
            }
            open.messages[pos].id = message_id.clone();
            changed = true;
        }

        if let Some(last) = state
            .summary_mut(session_id)
            .and_then(|s| s.last_message.as_mut())
            .filter(|m| m.id == *temp_id)
        {
            last.id = message_id.clone();
            changed = true;
        }
        if changed {
            state.sync_summary(session_id);
        }
        drop(state);

        if changed {
            tracing::debug!(temp_id = %temp_id, message_id = %message_id, "temporary ID reconciled");
            self.emit(SessionEvent::MessageReconciled {
                session_id: session_id.clone(),
                temp_id: temp_id.clone(),
                message_id: message_id.clone(),
            });
        }
        changed
    }
}

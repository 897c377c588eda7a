//! Outbound path: optimistic append, channel send, REST persistence.

use deskline_proto::message::{Message, MessageId, SessionId, validate_content};

use super::{ChatSessionController, SendFailure, SessionEvent};
use crate::api::SessionApi;
use crate::queue::QueuedMessage;
use crate::transport::{ChannelState, Transport};

impl<T: Transport, A: SessionApi> ChatSessionController<T, A> {
    /// Sends `content` to session `session_id`.
    ///
    /// The message is appended to the open session at once under a
    /// temporary ID, which is returned. With the channel open the frame is
    /// sent over it and, under the default [`DeliveryPolicy`], also
    /// persisted over REST. With the channel down only REST is used and the
    /// transport is asked to reconnect.
    ///
    /// The temporary ID is replaced in place when the channel acknowledges
    /// the message (see [`reconcile_temp_id`](Self::reconcile_temp_id)).
    ///
    /// [`DeliveryPolicy`]: super::DeliveryPolicy
    ///
    /// # Errors
    ///
    /// Returns a [`SendFailure`] carrying `content` back if validation
    /// fails, or if REST fails and the channel did not take the message.
    /// In the latter case the optimistic message has been removed again.
    pub async fn send_message(
        &self,
        session_id: &SessionId,
        content: &str,
    ) -> Result<MessageId, SendFailure> {
        if let Err(e) = validate_content(content) {
            return Err(SendFailure::new(content, e));
        }

        let temp_id = MessageId::temporary();
        let role = self.surface.sender_role();
        let optimistic = Message::new(temp_id.clone(), role, content);

        let (receiver_id, appended) = {
            let mut state = self.state.lock();
            let receiver = state.receiver_for(self.surface, session_id);
            let appended = match state.open_mut(session_id) {
                Some(open) => {
                    open.messages.push(optimistic.clone());
                    true
                }
                None => false,
            };
            if appended {
                state.sync_summary(session_id);
            }
            (receiver, appended)
        };
        if appended {
            self.emit(SessionEvent::MessageAppended {
                session_id: session_id.clone(),
                message: optimistic,
            });
        }

        let queued = QueuedMessage::new(
            session_id.clone(),
            content,
            role,
            receiver_id,
            temp_id.clone(),
        );

        let channel_accepted = if self.transport.state() == ChannelState::Open {
            match self.transport.send(&queued.to_frame()).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(temp_id = %temp_id, error = %e, "channel send failed, re-queuing");
                    self.queue.enqueue(queued);
                    false
                }
            }
        } else {
            if self.policy.queue_when_offline {
                self.queue.enqueue(queued);
            }
            self.transport.request_connect();
            false
        };

        if channel_accepted && !self.policy.dual_send {
            return Ok(temp_id);
        }

        match self
            .api
            .send_message(session_id, content, Some(&temp_id))
            .await
        {
            Ok(stored) => {
                tracing::debug!(
                    session_id = %session_id,
                    temp_id = %temp_id,
                    message_id = %stored.id,
                    "message persisted"
                );
                Ok(temp_id)
            }
            Err(e) if channel_accepted => {
                tracing::warn!(temp_id = %temp_id, error = %e, "REST persistence failed after channel send");
                Ok(temp_id)
            }
            Err(e) => {
                tracing::warn!(temp_id = %temp_id, error = %e, "message delivery failed, rolling back");
                self.queue.remove_by_temp_id(&temp_id);
                self.roll_back(session_id, &temp_id, content);
                Err(SendFailure::new(content, e))
            }
        }
    }

    /// Removes the optimistic message `temp_id`, if its session is still
    /// the open one.
    fn roll_back(&self, session_id: &SessionId, temp_id: &MessageId, content: &str) {
        let mut state = self.state.lock();
        if let Some(open) = state.open_mut(session_id) {
            open.messages.retain(|m| m.id != *temp_id);
            state.sync_summary(session_id);
        }
        drop(state);
        self.emit(SessionEvent::MessageRolledBack {
            session_id: session_id.clone(),
            temp_id: temp_id.clone(),
            content: content.to_string(),
        });
    }
}

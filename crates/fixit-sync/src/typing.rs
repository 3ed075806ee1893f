//! Typing-status plumbing.
//!
//! Typing state is ephemeral: it never enters the query cache and is
//! never persisted beyond the membership row the server fans out from.
//! Inbound changes are broadcast per chat to whoever is looking;
//! outbound changes go through an explicit [`TypingPublisher`] handed to
//! the input layer.

use dashmap::DashMap;
use fixit_store::Gateway;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::SyncError;

const TYPING_CHANNEL_CAPACITY: usize = 16;

/// One observed typing-state change in a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingEvent {
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub is_typing: bool,
}

/// Per-chat fan-out of [`TypingEvent`]s. Events for chats nobody is
/// subscribed to are dropped.
#[derive(Default)]
pub struct TypingEvents {
    channels: DashMap<Uuid, broadcast::Sender<TypingEvent>>,
}

impl TypingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, chat_id: Uuid) -> broadcast::Receiver<TypingEvent> {
        self.channels
            .entry(chat_id)
            .or_insert_with(|| broadcast::channel(TYPING_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub(crate) fn publish(&self, event: TypingEvent) {
        if let Some(sender) = self.channels.get(&event.chat_id) {
            trace!(
                chat_id = %event.chat_id,
                user_id = %event.user_id,
                is_typing = event.is_typing,
                "typing event"
            );
            let _ = sender.send(event);
        }
    }

    /// Drop a chat's channel once its last viewer leaves.
    pub(crate) fn forget(&self, chat_id: Uuid) {
        self.channels
            .remove_if(&chat_id, |_, sender| sender.receiver_count() == 0);
    }
}

/// Publishes the signed-in user's typing state on a chat.
///
/// Handed to the message-input layer as a value, so the wiring is
/// explicit rather than a mutable global. Failures are reported but
/// callers normally ignore them; typing state is best-effort.
#[derive(Clone)]
pub struct TypingPublisher {
    gateway: Gateway,
    user_id: Uuid,
}

impl TypingPublisher {
    pub fn new(gateway: Gateway, user_id: Uuid) -> Self {
        Self { gateway, user_id }
    }

    pub async fn publish(&self, chat_id: Uuid, is_typing: bool) -> Result<(), SyncError> {
        debug!(chat_id = %chat_id, is_typing, "publishing typing state");
        self.gateway
            .set_typing(chat_id, self.user_id, is_typing)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_only_that_chats_subscribers() {
        let events = TypingEvents::new();
        let chat_a = Uuid::from_u128(1);
        let chat_b = Uuid::from_u128(2);

        let mut on_a = events.subscribe(chat_a);
        let mut on_b = events.subscribe(chat_b);

        events.publish(TypingEvent {
            chat_id: chat_a,
            user_id: Uuid::from_u128(9),
            is_typing: true,
        });

        let received = on_a.recv().await.unwrap();
        assert_eq!(received.chat_id, chat_a);
        assert!(received.is_typing);
        assert!(on_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let events = TypingEvents::new();
        events.publish(TypingEvent {
            chat_id: Uuid::from_u128(3),
            user_id: Uuid::from_u128(9),
            is_typing: false,
        });
        // Nothing to assert beyond not panicking; no channel exists.
        assert!(events.channels.is_empty());
    }

    #[tokio::test]
    async fn forget_keeps_channels_with_live_receivers() {
        let events = TypingEvents::new();
        let chat = Uuid::from_u128(4);
        let receiver = events.subscribe(chat);

        events.forget(chat);
        assert!(events.channels.contains_key(&chat));

        drop(receiver);
        events.forget(chat);
        assert!(!events.channels.contains_key(&chat));
    }
}

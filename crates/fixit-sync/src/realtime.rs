//! Realtime change-feed bridge.
//!
//! One WebSocket connection carries every subscription. Channels are
//! addressed by topic, reference-counted, and live through connection
//! loss: the bridge reconnects with exponential backoff and re-subscribes
//! everything still held; only after the backoff budget is exhausted do
//! channels report `Lost`, and a fresh subscribe wakes the loop again. A
//! subscription the server rejects goes `Lost` straight away.
//!
//! Incoming change events are folded into the query cache on the reader
//! task, in server order. Folds are idempotent by row id, so duplicate
//! delivery cannot duplicate rows. Typing changes bypass the cache
//! entirely and fan out through [`TypingEvents`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use fixit_store::{ChatParticipant, Message as ChatMessage, Reaction, StoreError, tables};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::cache::QueryCache;
use crate::error::SyncError;
use crate::key::{KeyPattern, TAG_CHATS, keys};
use crate::typing::{TypingEvent, TypingEvents};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Side effect run for each folded message insert, registered by the
/// facade (marking foreign messages read).
pub type MessageHook =
    Arc<dyn Fn(ChatMessage) -> futures_util::future::BoxFuture<'static, ()> + Send + Sync>;

/// Frames sent to the feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        topic: String,
        table: String,
        filter: String,
    },
    Unsubscribe {
        topic: String,
    },
}

impl ClientFrame {
    fn subscribe(spec: &ChannelSpec) -> Self {
        ClientFrame::Subscribe {
            topic: spec.topic.clone(),
            table: spec.table.clone(),
            filter: spec.filter.clone(),
        }
    }
}

/// Frames received from the feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    Ack {
        topic: String,
    },
    Change {
        topic: String,
        #[serde(flatten)]
        event: ChangeEvent,
    },
    Error {
        topic: String,
        message: String,
    },
}

/// One row-level change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub op: ChangeOp,
    pub record: serde_json::Value,
    /// Previous row values; for deletes usually just the primary key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// Lifecycle of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for the server to acknowledge the subscription.
    Connecting,
    /// Events are being delivered.
    Subscribed,
    /// Terminal: last handle dropped, resources released.
    Closed,
    /// Reconnection budget exhausted, or the server rejected the topic;
    /// a fresh subscribe restarts it.
    Lost,
}

/// Addresses one server-side change stream: a table plus a row filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub topic: String,
    pub table: String,
    pub filter: String,
}

impl ChannelSpec {
    pub fn new(
        topic: impl Into<String>,
        table: impl Into<String>,
        filter: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            table: table.into(),
            filter: filter.into(),
        }
    }

    pub fn messages(chat_id: Uuid) -> Self {
        Self::new(
            format!("messages:{chat_id}"),
            tables::MESSAGES,
            format!("chat_id=eq.{chat_id}"),
        )
    }

    pub fn reactions(chat_id: Uuid) -> Self {
        Self::new(
            format!("reactions:{chat_id}"),
            tables::MESSAGE_REACTIONS,
            format!("chat_id=eq.{chat_id}"),
        )
    }

    pub fn typing(chat_id: Uuid) -> Self {
        Self::new(
            format!("typing:{chat_id}"),
            tables::CHAT_PARTICIPANTS,
            format!("chat_id=eq.{chat_id}"),
        )
    }
}

enum Command {
    Subscribe(ChannelSpec),
    Unsubscribe(String),
}

struct ChannelEntry {
    spec: ChannelSpec,
    refcount: usize,
    state: watch::Sender<ChannelState>,
}

struct BridgeInner {
    url: String,
    give_up_after: Duration,
    cache: QueryCache,
    typing: Arc<TypingEvents>,
    channels: std::sync::Mutex<HashMap<String, ChannelEntry>>,
    commands: mpsc::UnboundedSender<Command>,
    commands_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    message_hook: std::sync::RwLock<Option<MessageHook>>,
}

/// Client for the change feed. Clone freely; all clones share one
/// connection.
#[derive(Clone)]
pub struct RealtimeBridge {
    inner: Arc<BridgeInner>,
}

impl RealtimeBridge {
    pub fn new(
        url: impl Into<String>,
        give_up_after: Duration,
        cache: QueryCache,
        typing: Arc<TypingEvents>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(BridgeInner {
                url: url.into(),
                give_up_after,
                cache,
                typing,
                channels: std::sync::Mutex::new(HashMap::new()),
                commands,
                commands_rx: std::sync::Mutex::new(Some(commands_rx)),
                message_hook: std::sync::RwLock::new(None),
            }),
        }
    }

    /// Register the side effect run for folded message inserts.
    pub fn set_message_hook(&self, hook: MessageHook) {
        *self.inner.message_hook.write().unwrap() = Some(hook);
    }

    /// Open (or join) the channel for a spec. The first handle on a topic
    /// sends the subscribe frame; the last handle dropped sends the
    /// unsubscribe and releases the channel.
    pub fn subscribe(&self, spec: ChannelSpec) -> ChannelHandle {
        let state = {
            let mut channels = self.inner.channels.lock().unwrap();
            match channels.get_mut(&spec.topic) {
                Some(entry) => {
                    entry.refcount += 1;
                    // A lost channel gets a fresh attempt on re-subscribe.
                    if *entry.state.borrow() == ChannelState::Lost {
                        entry.state.send_replace(ChannelState::Connecting);
                    }
                    entry.state.subscribe()
                }
                None => {
                    let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
                    channels.insert(
                        spec.topic.clone(),
                        ChannelEntry {
                            spec: spec.clone(),
                            refcount: 1,
                            state: state_tx,
                        },
                    );
                    state_rx
                }
            }
        };
        debug!(topic = %spec.topic, "channel subscribe");
        let _ = self.inner.commands.send(Command::Subscribe(spec.clone()));
        ChannelHandle {
            topic: spec.topic,
            state,
            bridge: self.clone(),
        }
    }

    /// Connect and process the feed until shutdown. Reconnects with
    /// backoff on transport errors; once the budget is exhausted all
    /// channels go `Lost` and the loop parks until a fresh subscribe.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), SyncError> {
        let taken = self.inner.commands_rx.lock().unwrap().take();
        let Some(mut commands) = taken else {
            warn!("realtime bridge is already running");
            return Ok(());
        };

        let mut backoff = self.fresh_backoff();
        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }

            match self
                .connect_and_process(&mut commands, &mut shutdown_rx, &mut backoff)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(error = %err, "change feed connection error");
                    self.mark_all(ChannelState::Connecting);

                    match backoff.next_backoff() {
                        Some(delay) => {
                            debug!(delay_ms = delay.as_millis() as u64, "reconnecting");
                            tokio::select! {
                                _ = shutdown_rx.changed() => {
                                    if *shutdown_rx.borrow() {
                                        return Ok(());
                                    }
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => {
                            error!("change feed reconnection attempts exhausted");
                            self.mark_all(ChannelState::Lost);
                            self.park_until_woken(&mut commands, &mut shutdown_rx)
                                .await?;
                            if *shutdown_rx.borrow() {
                                return Ok(());
                            }
                            self.mark_all(ChannelState::Connecting);
                            backoff = self.fresh_backoff();
                        }
                    }
                }
            }
        }
    }

    /// After giving up, wait for a fresh subscribe before trying again.
    async fn park_until_woken(
        &self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Subscribe(spec)) => {
                        info!(topic = %spec.topic, "woken by fresh subscribe");
                        return Ok(());
                    }
                    Some(Command::Unsubscribe(_)) => {}
                    None => return Ok(()),
                }
            }
        }
    }

    async fn connect_and_process(
        &self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), SyncError> {
        debug!(url = %self.inner.url, "connecting to change feed");
        let (ws_stream, _) = connect_async(&self.inner.url)
            .await
            .map_err(|e| SyncError::Transport(format!("connect failed: {e}")))?;

        // A healthy connection earns a fresh reconnection budget.
        *backoff = self.fresh_backoff();

        let (mut write, mut read) = ws_stream.split();
        info!("change feed connected");

        // Re-subscribe everything still held. `sent` also swallows any
        // commands queued for topics this replay already covered.
        let mut sent: HashSet<String> = HashSet::new();
        for spec in self.live_specs() {
            send_frame(&mut write, &ClientFrame::subscribe(&spec)).await?;
            sent.insert(spec.topic);
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("realtime bridge shutting down");
                        let _ = write.close().await;
                        return Ok(());
                    }
                }

                command = commands.recv() => match command {
                    Some(Command::Subscribe(spec)) => {
                        if sent.insert(spec.topic.clone()) {
                            send_frame(&mut write, &ClientFrame::subscribe(&spec)).await?;
                        }
                    }
                    Some(Command::Unsubscribe(topic)) => {
                        if sent.remove(&topic) {
                            send_frame(&mut write, &ClientFrame::Unsubscribe { topic }).await?;
                        }
                    }
                    None => {
                        let _ = write.close().await;
                        return Ok(());
                    }
                },

                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match self.handle_frame(&text) {
                            Ok(Some(rejected)) => {
                                sent.remove(&rejected);
                            }
                            Ok(None) => {}
                            Err(err) => {
                                warn!(error = %err, "failed to handle change feed frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite answers pings itself
                        trace!("feed ping");
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Err(SyncError::Transport("closed by server".to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        return Err(SyncError::Transport(format!("read error: {err}")));
                    }
                    None => {
                        return Err(SyncError::Transport("stream ended".to_string()));
                    }
                },
            }
        }
    }

    /// Decode and dispatch one server frame. Returns the topic of a
    /// subscription the server rejected, so the connection loop can
    /// forget it was ever sent.
    fn handle_frame(&self, text: &str) -> Result<Option<String>, SyncError> {
        let frame: ServerFrame = serde_json::from_str(text).map_err(StoreError::from)?;
        match frame {
            ServerFrame::Ack { topic } => {
                debug!(topic = %topic, "channel acknowledged");
                self.set_state(&topic, ChannelState::Subscribed);
            }
            ServerFrame::Error { topic, message } => {
                // The server dropped this subscription; the channel is
                // lost until someone subscribes it afresh.
                warn!(topic = %topic, message = %message, "subscription rejected by server");
                self.set_state(&topic, ChannelState::Lost);
                return Ok(Some(topic));
            }
            ServerFrame::Change { topic, event } => {
                // Events are delivered only while subscribed; anything
                // arriving for a closed or unknown topic is dropped.
                if self.state_of(&topic) == Some(ChannelState::Subscribed) {
                    self.fold_change(&topic, &event);
                } else {
                    trace!(topic = %topic, "dropping event for inactive channel");
                }
            }
        }
        Ok(None)
    }

    fn fold_change(&self, topic: &str, event: &ChangeEvent) {
        match event.table.as_str() {
            tables::MESSAGES => self.fold_message(event),
            tables::MESSAGE_REACTIONS => self.fold_reaction(topic, event),
            tables::CHAT_PARTICIPANTS => self.fold_participant(event),
            other => trace!(table = other, "ignoring change for untracked table"),
        }
    }

    fn fold_message(&self, event: &ChangeEvent) {
        match event.op {
            ChangeOp::Insert => {
                let Ok(message) = serde_json::from_value::<ChatMessage>(event.record.clone())
                else {
                    warn!("undecodable message insert");
                    return;
                };
                let key = keys::messages(message.chat_id);

                let already_present = self
                    .inner
                    .cache
                    .peek(&key)
                    .is_some_and(|list| list.iter().any(|m| m.id == message.id));
                if already_present {
                    trace!(message_id = %message.id, "duplicate message delivery");
                    return;
                }

                trace!(message_id = %message.id, chat_id = %message.chat_id, "folding message insert");
                self.inner
                    .cache
                    .update_query_data(&key, |list: &Vec<ChatMessage>| {
                        append_message(list, &message)
                    });
                // Conversation list shows last message and unread counts.
                self.inner.cache.invalidate(&KeyPattern::tag(TAG_CHATS));

                let hook = self.inner.message_hook.read().unwrap().clone();
                if let Some(hook) = hook {
                    let message = message.clone();
                    tokio::spawn(async move {
                        hook(message).await;
                    });
                }
            }
            ChangeOp::Update => {
                let Ok(message) = serde_json::from_value::<ChatMessage>(event.record.clone())
                else {
                    warn!("undecodable message update");
                    return;
                };
                let key = keys::messages(message.chat_id);
                self.inner
                    .cache
                    .update_query_data(&key, |list: &Vec<ChatMessage>| {
                        replace_message(list, &message)
                    });
            }
            ChangeOp::Delete => {
                let source = event.old.as_ref().unwrap_or(&event.record);
                let Ok(row) = serde_json::from_value::<MessageRef>(source.clone()) else {
                    warn!("undecodable message delete");
                    return;
                };
                let Some(chat_id) = row.chat_id.or_else(|| chat_from_topic_record(event)) else {
                    return;
                };
                let key = keys::messages(chat_id);
                self.inner
                    .cache
                    .update_query_data(&key, |list: &Vec<ChatMessage>| {
                        remove_message(list, row.id)
                    });
            }
        }
    }

    fn fold_reaction(&self, topic: &str, event: &ChangeEvent) {
        // Reaction rows do not carry the chat id; the channel topic does.
        let Some(chat_id) = chat_from_topic(topic) else {
            warn!(topic = %topic, "reaction event on unscoped topic");
            return;
        };
        let key = keys::messages(chat_id);

        match event.op {
            ChangeOp::Insert => {
                let Ok(reaction) = serde_json::from_value::<Reaction>(event.record.clone())
                else {
                    warn!("undecodable reaction insert");
                    return;
                };
                trace!(reaction_id = %reaction.id, "folding reaction insert");
                self.inner
                    .cache
                    .update_query_data(&key, |list: &Vec<ChatMessage>| {
                        apply_reaction_insert(list, &reaction)
                    });
            }
            ChangeOp::Delete => {
                let source = event.old.as_ref().unwrap_or(&event.record);
                let Ok(row) = serde_json::from_value::<ReactionRef>(source.clone()) else {
                    warn!("undecodable reaction delete");
                    return;
                };
                self.inner
                    .cache
                    .update_query_data(&key, |list: &Vec<ChatMessage>| {
                        remove_reaction(list, row.id)
                    });
            }
            ChangeOp::Update => {
                trace!("ignoring reaction update");
            }
        }
    }

    /// Typing state never touches the cache: pure fan-out.
    fn fold_participant(&self, event: &ChangeEvent) {
        if event.op != ChangeOp::Update {
            trace!(op = ?event.op, "ignoring participant change");
            return;
        }
        let Ok(participant) = serde_json::from_value::<ChatParticipant>(event.record.clone())
        else {
            warn!("undecodable participant update");
            return;
        };
        self.inner.typing.publish(TypingEvent {
            chat_id: participant.chat_id,
            user_id: participant.user_id,
            is_typing: participant.is_typing,
        });
    }

    fn release(&self, topic: &str) {
        let removed = {
            let mut channels = self.inner.channels.lock().unwrap();
            let Some(entry) = channels.get_mut(topic) else {
                return;
            };
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 {
                entry.state.send_replace(ChannelState::Closed);
                channels.remove(topic);
                true
            } else {
                false
            }
        };
        if removed {
            debug!(topic = %topic, "channel closed");
            let _ = self
                .inner
                .commands
                .send(Command::Unsubscribe(topic.to_string()));
        }
    }

    fn set_state(&self, topic: &str, state: ChannelState) {
        if let Some(entry) = self.inner.channels.lock().unwrap().get(topic) {
            entry.state.send_replace(state);
        }
    }

    fn state_of(&self, topic: &str) -> Option<ChannelState> {
        self.inner
            .channels
            .lock()
            .unwrap()
            .get(topic)
            .map(|entry| *entry.state.borrow())
    }

    fn live_specs(&self) -> Vec<ChannelSpec> {
        self.inner
            .channels
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.spec.clone())
            .collect()
    }

    fn mark_all(&self, state: ChannelState) {
        for entry in self.inner.channels.lock().unwrap().values() {
            entry.state.send_replace(state);
        }
    }

    fn fresh_backoff(&self) -> ExponentialBackoff {
        backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(250))
            .with_max_interval(Duration::from_secs(10))
            .with_max_elapsed_time(Some(self.inner.give_up_after))
            .build()
    }
}

async fn send_frame(write: &mut WsSink, frame: &ClientFrame) -> Result<(), SyncError> {
    let text = serde_json::to_string(frame).map_err(StoreError::from)?;
    write
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| SyncError::Transport(format!("send failed: {e}")))
}

/// Handle on one channel subscription. Dropping it releases the
/// subscription; when the last handle for a topic goes, the server-side
/// subscription is torn down.
pub struct ChannelHandle {
    topic: String,
    state: watch::Receiver<ChannelState>,
    bridge: RealtimeBridge,
}

impl ChannelHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Wait until the server acknowledges the subscription. Errors with
    /// `SubscriptionLost` if the channel is lost or closed first.
    pub async fn wait_subscribed(&mut self) -> Result<(), SyncError> {
        loop {
            match *self.state.borrow_and_update() {
                ChannelState::Subscribed => return Ok(()),
                ChannelState::Lost | ChannelState::Closed => {
                    return Err(SyncError::SubscriptionLost {
                        topic: self.topic.clone(),
                    });
                }
                ChannelState::Connecting => {}
            }
            if self.state.changed().await.is_err() {
                return Err(SyncError::SubscriptionLost {
                    topic: self.topic.clone(),
                });
            }
        }
    }

    /// Wait for the next state transition.
    pub async fn state_changed(&mut self) -> ChannelState {
        let _ = self.state.changed().await;
        *self.state.borrow_and_update()
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.bridge.release(&self.topic);
    }
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: Uuid,
    #[serde(default)]
    chat_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct ReactionRef {
    id: Uuid,
}

/// Topics are `kind:chat_id`; recover the chat scope for tables whose
/// rows do not carry it.
fn chat_from_topic(topic: &str) -> Option<Uuid> {
    let (_, id) = topic.rsplit_once(':')?;
    id.parse().ok()
}

fn chat_from_topic_record(event: &ChangeEvent) -> Option<Uuid> {
    event
        .record
        .get("chat_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
}

fn append_message(list: &[ChatMessage], incoming: &ChatMessage) -> Vec<ChatMessage> {
    if list.iter().any(|m| m.id == incoming.id) {
        return list.to_vec();
    }
    let mut next = list.to_vec();
    next.push(incoming.clone());
    next
}

fn replace_message(list: &[ChatMessage], incoming: &ChatMessage) -> Vec<ChatMessage> {
    list.iter()
        .map(|m| {
            if m.id == incoming.id {
                // Server update rows lack expansions; keep what we had.
                let mut updated = incoming.clone();
                if updated.sender.is_none() {
                    updated.sender = m.sender.clone();
                }
                if updated.reactions.is_empty() {
                    updated.reactions = m.reactions.clone();
                }
                updated
            } else {
                m.clone()
            }
        })
        .collect()
}

fn remove_message(list: &[ChatMessage], id: Uuid) -> Vec<ChatMessage> {
    list.iter().filter(|m| m.id != id).cloned().collect()
}

fn apply_reaction_insert(list: &[ChatMessage], reaction: &Reaction) -> Vec<ChatMessage> {
    list.iter()
        .map(|m| {
            if m.id == reaction.message_id && !m.reactions.iter().any(|r| r.id == reaction.id) {
                let mut updated = m.clone();
                updated.reactions.push(reaction.clone());
                updated
            } else {
                m.clone()
            }
        })
        .collect()
}

fn remove_reaction(list: &[ChatMessage], reaction_id: Uuid) -> Vec<ChatMessage> {
    list.iter()
        .map(|m| {
            if m.reactions.iter().any(|r| r.id == reaction_id) {
                let mut updated = m.clone();
                updated.reactions.retain(|r| r.id != reaction_id);
                updated
            } else {
                m.clone()
            }
        })
        .collect()
}

//! High-level handle over the whole sync layer.
//!
//! One [`SyncClient`] is built at startup and handed around (or cloned)
//! wherever data access happens. It owns the gateway, the query cache,
//! the mutation engine, and the realtime bridge, and wires them together:
//! queries go through the cache with per-tag policies, mutations run
//! optimistically with rollback, and folded chat events trigger the
//! mark-read side effect.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fixit_store::{
    AuthClient, Bid, BidPatch, BidStatus, Category, Chat, ChatSummary, Gateway, Message,
    NewBid, NewCategory, NewMessage, NewProject, NewReaction, NewService, ProfilePatch, Project,
    ProjectFilters, ProjectPatch, ProjectStatus, ProviderFilters, Reaction, Service, ServicePatch,
    Session, SignUpMetadata, SignUpOutcome, StoreClient, StoreError, User,
};
use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::{QueryCache, QueryRef};
use crate::error::SyncError;
use crate::key::{KeyPattern, TAG_CHATS, TAG_PROJECTS, TAG_PROVIDERS, keys};
use crate::mutation::{MutationEngine, MutationPlan};
use crate::policy::PolicyTable;
use crate::realtime::{ChannelHandle, ChannelSpec, ChannelState, MessageHook, RealtimeBridge};
use crate::typing::{TypingEvent, TypingEvents, TypingPublisher};

/// How long the realtime bridge keeps retrying a dead connection before
/// marking channels lost.
pub const DEFAULT_REALTIME_GIVE_UP: Duration = Duration::from_secs(5 * 60);

/// Connection settings for one sync client.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Project base URL; row requests go to `{base_url}/rest/v1`.
    pub base_url: String,
    /// Identity endpoint, `{base_url}/auth/v1` unless overridden.
    pub auth_url: String,
    /// Change feed endpoint, derived from `base_url` unless overridden.
    pub realtime_url: String,
    pub api_key: String,
    pub policies: PolicyTable,
    pub realtime_give_up_after: Duration,
}

/// Builder for a [`SyncClient`] with optional overrides.
pub struct SyncClientBuilder {
    base_url: String,
    api_key: String,
    auth_url: Option<String>,
    realtime_url: Option<String>,
    policies: Option<PolicyTable>,
    realtime_give_up_after: Option<Duration>,
}

impl SyncClientBuilder {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            auth_url: None,
            realtime_url: None,
            policies: None,
            realtime_give_up_after: None,
        }
    }

    /// Use an identity endpoint other than `{base_url}/auth/v1`.
    pub fn auth_url(mut self, url: impl Into<String>) -> Self {
        self.auth_url = Some(url.into());
        self
    }

    /// Use a change feed endpoint other than the derived default.
    pub fn realtime_url(mut self, url: impl Into<String>) -> Self {
        self.realtime_url = Some(url.into());
        self
    }

    pub fn policies(mut self, policies: PolicyTable) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn realtime_give_up_after(mut self, after: Duration) -> Self {
        self.realtime_give_up_after = Some(after);
        self
    }

    pub fn build(self) -> SyncClient {
        let base_url = self.base_url.trim_end_matches('/').to_string();
        let auth_url = self
            .auth_url
            .unwrap_or_else(|| format!("{base_url}/auth/v1"));
        let realtime_url = self
            .realtime_url
            .unwrap_or_else(|| default_realtime_url(&base_url));

        SyncClient::new(SyncConfig {
            base_url,
            auth_url,
            realtime_url,
            api_key: self.api_key,
            policies: self.policies.unwrap_or_default(),
            realtime_give_up_after: self
                .realtime_give_up_after
                .unwrap_or(DEFAULT_REALTIME_GIVE_UP),
        })
    }
}

fn default_realtime_url(base_url: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    };
    format!("{ws_base}/realtime/v1")
}

/// The one owned service instance of the sync layer. Clone freely; all
/// clones share the same cache, session, and connection.
#[derive(Clone)]
pub struct SyncClient {
    auth: AuthClient,
    gateway: Gateway,
    cache: QueryCache,
    engine: MutationEngine,
    realtime: RealtimeBridge,
    typing_events: Arc<TypingEvents>,
}

impl SyncClient {
    pub fn new(config: SyncConfig) -> Self {
        let auth = AuthClient::new(config.auth_url.clone(), config.api_key.clone());
        let store = StoreClient::new(
            config.base_url.clone(),
            config.api_key.clone(),
            auth.session_slot(),
        );
        let gateway = Gateway::new(store);
        let cache = QueryCache::new(config.policies.clone());
        let engine = MutationEngine::new(cache.clone());
        let typing_events = Arc::new(TypingEvents::default());
        let realtime = RealtimeBridge::new(
            config.realtime_url.clone(),
            config.realtime_give_up_after,
            cache.clone(),
            Arc::clone(&typing_events),
        );

        let client = Self {
            auth,
            gateway,
            cache,
            engine,
            realtime,
            typing_events,
        };
        client.realtime.set_message_hook(client.mark_read_hook());
        client
    }

    /// Spawn the background halves: cache maintenance (stale sweeps and
    /// interval refetches) and the realtime connection loop. Both stop
    /// when `shutdown_rx` flips to true.
    pub fn start(&self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        info!("starting sync background tasks");
        let maintenance = self.cache.spawn_maintenance();
        let bridge = self.realtime.clone();
        tokio::spawn(async move {
            if let Err(err) = bridge.run(shutdown_rx).await {
                error!(error = %err, "realtime bridge task failed");
            }
            maintenance.abort();
        })
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn engine(&self) -> &MutationEngine {
        &self.engine
    }

    // ---- identity -------------------------------------------------------

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, SyncError> {
        Ok(self.auth.sign_in(email, password).await?)
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &SignUpMetadata,
    ) -> Result<SignUpOutcome, SyncError> {
        Ok(self.auth.sign_up(email, password, metadata).await?)
    }

    pub async fn resend_verification(&self, email: &str) -> Result<(), SyncError> {
        Ok(self.auth.resend_verification(email).await?)
    }

    /// Sign out and drop every cached entry; nothing cached for one
    /// account may be served to the next.
    pub async fn sign_out(&self) -> Result<(), SyncError> {
        self.auth.sign_out().await?;
        self.cache.clear();
        Ok(())
    }

    pub async fn user_id(&self) -> Option<Uuid> {
        self.auth.user_id().await
    }

    // ---- queries --------------------------------------------------------

    pub fn categories(&self) -> QueryRef<Vec<Category>> {
        let gateway = self.gateway.clone();
        self.cache.query(&keys::categories(), move || {
            let gateway = gateway.clone();
            async move { gateway.fetch_categories().await }
        })
    }

    pub fn projects(&self, user_id: Uuid, filters: &ProjectFilters) -> QueryRef<Vec<Project>> {
        let gateway = self.gateway.clone();
        let fetch_filters = filters.clone();
        self.cache.query(&keys::projects(user_id, filters), move || {
            let gateway = gateway.clone();
            let filters = fetch_filters.clone();
            async move { gateway.fetch_projects(user_id, &filters).await }
        })
    }

    pub fn project(&self, project_id: Uuid) -> QueryRef<Project> {
        let gateway = self.gateway.clone();
        self.cache.query(&keys::project(project_id), move || {
            let gateway = gateway.clone();
            async move { gateway.fetch_project(project_id).await }
        })
    }

    pub fn providers(&self, filters: &ProviderFilters) -> QueryRef<Vec<User>> {
        let gateway = self.gateway.clone();
        let fetch_filters = filters.clone();
        self.cache.query(&keys::providers(filters), move || {
            let gateway = gateway.clone();
            let filters = fetch_filters.clone();
            async move { gateway.fetch_providers(&filters).await }
        })
    }

    pub fn profile(&self, user_id: Uuid) -> QueryRef<User> {
        let gateway = self.gateway.clone();
        self.cache.query(&keys::profile(user_id), move || {
            let gateway = gateway.clone();
            async move { gateway.fetch_user(user_id).await }
        })
    }

    pub fn chats(&self, user_id: Uuid) -> QueryRef<Vec<ChatSummary>> {
        let gateway = self.gateway.clone();
        self.cache.query(&keys::chats(user_id), move || {
            let gateway = gateway.clone();
            async move { gateway.fetch_chat_summaries(user_id).await }
        })
    }

    pub fn messages(&self, chat_id: Uuid) -> QueryRef<Vec<Message>> {
        let gateway = self.gateway.clone();
        self.cache.query(&keys::messages(chat_id), move || {
            let gateway = gateway.clone();
            async move { gateway.fetch_messages(chat_id).await }
        })
    }

    // ---- prefetch warmers -----------------------------------------------

    pub fn prefetch_categories(&self) {
        let gateway = self.gateway.clone();
        self.cache.prefetch(&keys::categories(), move || {
            let gateway = gateway.clone();
            async move { gateway.fetch_categories().await }
        });
    }

    pub fn prefetch_providers(&self, filters: &ProviderFilters) {
        let gateway = self.gateway.clone();
        let fetch_filters = filters.clone();
        self.cache.prefetch(&keys::providers(filters), move || {
            let gateway = gateway.clone();
            let filters = fetch_filters.clone();
            async move { gateway.fetch_providers(&filters).await }
        });
    }

    pub fn prefetch_projects(&self, user_id: Uuid) {
        let gateway = self.gateway.clone();
        let filters = ProjectFilters::default();
        self.cache
            .prefetch(&keys::projects(user_id, &filters), move || {
                let gateway = gateway.clone();
                let filters = filters.clone();
                async move { gateway.fetch_projects(user_id, &filters).await }
            });
    }

    /// Revalidate stale subscribed entries whose policy refetches on
    /// focus. The UI layer calls this when the app regains attention.
    pub fn focus_changed(&self) {
        self.cache.focus_changed();
    }

    // ---- mutations ------------------------------------------------------

    /// Create a project. The server row is spliced into the creator's
    /// unfiltered list and warms the detail slot; filtered lists refetch.
    pub async fn create_project(&self, new: &NewProject) -> Result<Project, SyncError> {
        let list_key = keys::projects(new.client_id, &ProjectFilters::default());
        let plan = MutationPlan::new()
            .commit(
                &list_key,
                |created: &Project, list: Option<&Vec<Project>>| {
                    list.map(|current| prepend_project(current, created))
                },
            )
            .invalidate(KeyPattern::tag(TAG_PROJECTS));

        let gateway = self.gateway.clone();
        let new = new.clone();
        let project = self
            .engine
            .run(plan, move || async move { gateway.create_project(&new).await })
            .await?;

        // The detail key exists only once the server assigned an id.
        self.cache
            .set_query_data(&keys::project(project.id), project.clone());
        Ok(project)
    }

    /// Patch a project, optimistically on its detail entry.
    pub async fn update_project(
        &self,
        project_id: Uuid,
        patch: &ProjectPatch,
    ) -> Result<Project, SyncError> {
        let detail_key = keys::project(project_id);
        let projected = patch.clone();
        let plan = MutationPlan::new()
            .patch(&detail_key, move |current: &Project| {
                apply_project_patch(current, &projected)
            })
            .commit(&detail_key, |updated: &Project, _: Option<&Project>| {
                Some(updated.clone())
            })
            .invalidate(KeyPattern::tag(TAG_PROJECTS));

        let gateway = self.gateway.clone();
        let patch = patch.clone();
        self.engine
            .run(plan, move || async move {
                gateway.update_project(project_id, &patch).await
            })
            .await
    }

    /// Place a bid; it appears on the cached project detail immediately.
    pub async fn create_bid(&self, new: &NewBid) -> Result<Bid, SyncError> {
        let detail_key = keys::project(new.project_id);
        let temp_id = Uuid::new_v4();
        let placeholder = Bid {
            id: temp_id,
            project_id: new.project_id,
            provider_id: new.provider_id,
            bid_amount: new.bid_amount,
            message: new.message.clone(),
            status: BidStatus::Pending,
            created_at: Utc::now(),
            provider: None,
        };

        let plan = MutationPlan::new()
            .patch(&detail_key, move |project: &Project| {
                let mut next = project.clone();
                next.bids.push(placeholder.clone());
                next
            })
            .commit(
                &detail_key,
                move |created: &Bid, current: Option<&Project>| {
                    current.map(|project| settle_bid(project, temp_id, created))
                },
            )
            .invalidate(KeyPattern::tag(TAG_PROJECTS));

        let gateway = self.gateway.clone();
        let new = new.clone();
        self.engine
            .run(plan, move || async move { gateway.create_bid(&new).await })
            .await
    }

    /// Patch one bid on a project (e.g. the provider editing the amount).
    pub async fn update_bid(
        &self,
        project_id: Uuid,
        bid_id: Uuid,
        patch: &BidPatch,
    ) -> Result<Bid, SyncError> {
        let detail_key = keys::project(project_id);
        let projected = patch.clone();
        let plan = MutationPlan::new()
            .patch(&detail_key, move |project: &Project| {
                apply_bid_patch(project, bid_id, &projected)
            })
            .commit(
                &detail_key,
                |updated: &Bid, current: Option<&Project>| {
                    current.map(|project| {
                        let mut next = project.clone();
                        for bid in &mut next.bids {
                            if bid.id == updated.id {
                                *bid = updated.clone();
                            }
                        }
                        next
                    })
                },
            )
            .invalidate(KeyPattern::tag(TAG_PROJECTS));

        let gateway = self.gateway.clone();
        let patch = patch.clone();
        self.engine
            .run(plan, move || async move { gateway.update_bid(bid_id, &patch).await })
            .await
    }

    /// Accept one bid. The accepted bid, its siblings, and the project
    /// status flip together in the cached detail, and flip back together
    /// if any remote step fails.
    pub async fn accept_bid(
        &self,
        project_id: Uuid,
        bid_id: Uuid,
        provider_id: Uuid,
    ) -> Result<(), SyncError> {
        let detail_key = keys::project(project_id);
        let plan = MutationPlan::new()
            .patch(&detail_key, move |project: &Project| {
                accept_bid_locally(project, bid_id, provider_id)
            })
            .invalidate(KeyPattern::tag(TAG_PROJECTS))
            .invalidate(KeyPattern::exact(keys::project(project_id).into_key()));

        let gateway = self.gateway.clone();
        self.engine
            .run(plan, move || async move {
                accept_bid_remote(&gateway, project_id, bid_id, provider_id).await
            })
            .await
    }

    /// Send a chat message. A placeholder row with a client-generated id
    /// appears immediately and is swapped for the server row on success.
    pub async fn send_message(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        content: impl Into<String>,
    ) -> Result<Message, SyncError> {
        let content = content.into();
        let messages_key = keys::messages(chat_id);
        let temp_id = Uuid::new_v4();
        let placeholder = Message {
            id: temp_id,
            chat_id,
            sender_id,
            content: content.clone(),
            is_read: false,
            created_at: Utc::now(),
            sender: None,
            reactions: Vec::new(),
        };

        let plan = MutationPlan::new()
            .patch(&messages_key, move |list: &Vec<Message>| {
                let mut next = list.clone();
                next.push(placeholder.clone());
                next
            })
            .commit(
                &messages_key,
                move |sent: &Message, current: Option<&Vec<Message>>| {
                    current.map(|list| settle_sent_message(list, temp_id, sent))
                },
            )
            .invalidate(KeyPattern::exact(keys::messages(chat_id).into_key()))
            .invalidate(KeyPattern::tag(TAG_CHATS));

        let gateway = self.gateway.clone();
        let new = NewMessage {
            chat_id,
            sender_id,
            content,
            is_read: false,
        };
        self.engine
            .run(plan, move || async move { gateway.send_message(&new).await })
            .await
    }

    /// Flag every message from other senders as read, locally first.
    pub async fn mark_chat_read(&self, chat_id: Uuid, reader_id: Uuid) -> Result<(), SyncError> {
        run_mark_read(&self.engine, &self.gateway, chat_id, reader_id).await
    }

    /// Attach an emoji reaction to a message in the given chat.
    pub async fn add_reaction(
        &self,
        chat_id: Uuid,
        new: &NewReaction,
    ) -> Result<Reaction, SyncError> {
        let messages_key = keys::messages(chat_id);
        let temp_id = Uuid::new_v4();
        let placeholder = Reaction {
            id: temp_id,
            message_id: new.message_id,
            user_id: new.user_id,
            emoji: new.emoji.clone(),
            user: None,
        };

        let plan = MutationPlan::new()
            .patch(&messages_key, move |list: &Vec<Message>| {
                add_reaction_locally(list, &placeholder)
            })
            .commit(
                &messages_key,
                move |created: &Reaction, current: Option<&Vec<Message>>| {
                    current.map(|list| settle_reaction(list, temp_id, created))
                },
            );

        let gateway = self.gateway.clone();
        let new = new.clone();
        self.engine
            .run(plan, move || async move { gateway.add_reaction(&new).await })
            .await
    }

    /// Remove the viewer's reaction; the row disappears locally at once.
    pub async fn remove_reaction(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: impl Into<String>,
    ) -> Result<(), SyncError> {
        let emoji = emoji.into();
        let messages_key = keys::messages(chat_id);
        let projected_emoji = emoji.clone();
        let plan = MutationPlan::new().patch(&messages_key, move |list: &Vec<Message>| {
            remove_reaction_locally(list, message_id, user_id, &projected_emoji)
        });

        let gateway = self.gateway.clone();
        self.engine
            .run(plan, move || async move {
                gateway.remove_reaction(message_id, user_id, &emoji).await
            })
            .await
    }

    /// Update a profile row; provider listings refetch to match.
    pub async fn update_profile(
        &self,
        user_id: Uuid,
        patch: &ProfilePatch,
    ) -> Result<User, SyncError> {
        let plan = MutationPlan::new()
            .commit(
                &keys::profile(user_id),
                |updated: &User, _: Option<&User>| Some(updated.clone()),
            )
            .invalidate(KeyPattern::tag(TAG_PROVIDERS));

        let gateway = self.gateway.clone();
        let patch = patch.clone();
        self.engine
            .run(plan, move || async move { gateway.update_user(user_id, &patch).await })
            .await
    }

    /// Add a category; the cached list stays name-sorted.
    pub async fn create_category(&self, new: &NewCategory) -> Result<Category, SyncError> {
        let plan = MutationPlan::new().commit(
            &keys::categories(),
            |created: &Category, list: Option<&Vec<Category>>| {
                list.map(|current| {
                    let mut next = current.clone();
                    next.push(created.clone());
                    next.sort_by(|a, b| a.name.cmp(&b.name));
                    next
                })
            },
        );

        let gateway = self.gateway.clone();
        let new = new.clone();
        self.engine
            .run(plan, move || async move { gateway.create_category(&new).await })
            .await
    }

    pub async fn create_service(&self, new: &NewService) -> Result<Service, SyncError> {
        let plan = MutationPlan::new()
            .invalidate(KeyPattern::exact(keys::profile(new.provider_id).into_key()))
            .invalidate(KeyPattern::tag(TAG_PROVIDERS));

        let gateway = self.gateway.clone();
        let new = new.clone();
        self.engine
            .run(plan, move || async move { gateway.create_service(&new).await })
            .await
    }

    pub async fn update_service(
        &self,
        provider_id: Uuid,
        service_id: Uuid,
        patch: &ServicePatch,
    ) -> Result<Service, SyncError> {
        let plan = MutationPlan::new()
            .invalidate(KeyPattern::exact(keys::profile(provider_id).into_key()))
            .invalidate(KeyPattern::tag(TAG_PROVIDERS));

        let gateway = self.gateway.clone();
        let patch = patch.clone();
        self.engine
            .run(plan, move || async move {
                gateway.update_service(service_id, &patch).await
            })
            .await
    }

    // ---- chat -----------------------------------------------------------

    /// Find the chat shared with `other_id`, creating it (with both
    /// memberships) on first contact.
    pub async fn start_chat(&self, user_id: Uuid, other_id: Uuid) -> Result<Chat, SyncError> {
        let chat = self.gateway.find_or_create_chat(user_id, other_id).await?;
        self.cache.invalidate(&KeyPattern::tag(TAG_CHATS));
        Ok(chat)
    }

    /// Open the realtime channel set for one conversation: message,
    /// reaction, and typing streams, torn down together on drop.
    pub fn open_chat(&self, chat_id: Uuid) -> ChatSession {
        ChatSession {
            chat_id,
            messages: self.realtime.subscribe(ChannelSpec::messages(chat_id)),
            reactions: self.realtime.subscribe(ChannelSpec::reactions(chat_id)),
            typing: self.realtime.subscribe(ChannelSpec::typing(chat_id)),
            typing_events: Arc::clone(&self.typing_events),
        }
    }

    /// Callback object for the message input layer to report typing
    /// state through.
    pub fn typing_publisher(&self, user_id: Uuid) -> TypingPublisher {
        TypingPublisher::new(self.gateway.clone(), user_id)
    }

    /// Fold hook: a foreign message arriving while its chat is open is
    /// marked read on the server right away.
    fn mark_read_hook(&self) -> MessageHook {
        let engine = self.engine.clone();
        let gateway = self.gateway.clone();
        let session = self.auth.session_slot();
        Arc::new(move |message: Message| -> BoxFuture<'static, ()> {
            let engine = engine.clone();
            let gateway = gateway.clone();
            let session = session.clone();
            Box::pin(async move {
                let me = session.read().await.as_ref().map(|s| s.user_id);
                let Some(reader_id) = me else { return };
                if message.sender_id == reader_id || message.is_read {
                    return;
                }
                if let Err(err) =
                    run_mark_read(&engine, &gateway, message.chat_id, reader_id).await
                {
                    warn!(error = %err, chat_id = %message.chat_id, "failed to mark chat read");
                }
            })
        })
    }
}

async fn run_mark_read(
    engine: &MutationEngine,
    gateway: &Gateway,
    chat_id: Uuid,
    reader_id: Uuid,
) -> Result<(), SyncError> {
    let plan = MutationPlan::new()
        .patch(&keys::messages(chat_id), move |list: &Vec<Message>| {
            mark_read_locally(list, reader_id)
        })
        .invalidate(KeyPattern::tag(TAG_CHATS));

    let gateway = gateway.clone();
    engine
        .run(plan, move || async move {
            gateway.mark_messages_read(chat_id, reader_id).await
        })
        .await
}

/// The three remote writes behind an acceptance, in order. Steps that
/// already landed are compensated (best effort) when a later one fails,
/// so the server is not left half-switched.
async fn accept_bid_remote(
    gateway: &Gateway,
    project_id: Uuid,
    bid_id: Uuid,
    provider_id: Uuid,
) -> Result<(), StoreError> {
    let accept = BidPatch {
        status: Some(BidStatus::Accepted),
        ..Default::default()
    };
    gateway.update_bid(bid_id, &accept).await?;

    let assign = ProjectPatch {
        status: Some(ProjectStatus::InProgress),
        provider_id: Some(Some(provider_id)),
        ..Default::default()
    };
    if let Err(err) = gateway.update_project(project_id, &assign).await {
        revert_bid(gateway, bid_id).await;
        return Err(err);
    }

    if let Err(err) = gateway.reject_other_bids(project_id, bid_id).await {
        let unassign = ProjectPatch {
            status: Some(ProjectStatus::Open),
            provider_id: Some(None),
            ..Default::default()
        };
        if let Err(undo) = gateway.update_project(project_id, &unassign).await {
            warn!(error = %undo, project_id = %project_id, "failed to revert project assignment");
        }
        revert_bid(gateway, bid_id).await;
        return Err(err);
    }

    Ok(())
}

async fn revert_bid(gateway: &Gateway, bid_id: Uuid) {
    let pending = BidPatch {
        status: Some(BidStatus::Pending),
        ..Default::default()
    };
    if let Err(err) = gateway.update_bid(bid_id, &pending).await {
        warn!(error = %err, bid_id = %bid_id, "failed to revert bid acceptance");
    }
}

fn prepend_project(list: &[Project], created: &Project) -> Vec<Project> {
    let mut next = Vec::with_capacity(list.len() + 1);
    next.push(created.clone());
    next.extend(list.iter().filter(|p| p.id != created.id).cloned());
    next
}

fn apply_project_patch(current: &Project, patch: &ProjectPatch) -> Project {
    let mut next = current.clone();
    if let Some(status) = patch.status {
        next.status = status;
    }
    if let Some(provider_id) = patch.provider_id {
        next.provider_id = provider_id;
    }
    if let Some(category_id) = patch.category_id {
        next.category_id = category_id;
    }
    if let Some(title) = &patch.title {
        next.title = title.clone();
    }
    if let Some(description) = &patch.description {
        next.description = description.clone();
    }
    if let Some(budget) = patch.budget {
        next.budget = Some(budget);
    }
    if let Some(location) = &patch.location {
        next.location = Some(location.clone());
    }
    next
}

fn apply_bid_patch(project: &Project, bid_id: Uuid, patch: &BidPatch) -> Project {
    let mut next = project.clone();
    for bid in &mut next.bids {
        if bid.id != bid_id {
            continue;
        }
        if let Some(status) = patch.status {
            bid.status = status;
        }
        if let Some(amount) = patch.bid_amount {
            bid.bid_amount = amount;
        }
        if let Some(message) = &patch.message {
            bid.message = Some(message.clone());
        }
    }
    next
}

fn accept_bid_locally(project: &Project, bid_id: Uuid, provider_id: Uuid) -> Project {
    let mut next = project.clone();
    next.status = ProjectStatus::InProgress;
    next.provider_id = Some(provider_id);
    for bid in &mut next.bids {
        bid.status = if bid.id == bid_id {
            BidStatus::Accepted
        } else {
            BidStatus::Rejected
        };
    }
    next
}

fn settle_bid(project: &Project, temp_id: Uuid, created: &Bid) -> Project {
    let mut next = project.clone();
    next.bids.retain(|b| b.id != temp_id);
    if !next.bids.iter().any(|b| b.id == created.id) {
        next.bids.push(created.clone());
    }
    next
}

fn settle_sent_message(list: &[Message], temp_id: Uuid, sent: &Message) -> Vec<Message> {
    let mut next: Vec<Message> = list.iter().filter(|m| m.id != temp_id).cloned().collect();
    if !next.iter().any(|m| m.id == sent.id) {
        next.push(sent.clone());
    }
    next
}

fn mark_read_locally(list: &[Message], reader_id: Uuid) -> Vec<Message> {
    list.iter()
        .map(|m| {
            if m.sender_id != reader_id && !m.is_read {
                let mut read = m.clone();
                read.is_read = true;
                read
            } else {
                m.clone()
            }
        })
        .collect()
}

fn add_reaction_locally(list: &[Message], reaction: &Reaction) -> Vec<Message> {
    list.iter()
        .map(|m| {
            if m.id == reaction.message_id {
                let mut next = m.clone();
                next.reactions.push(reaction.clone());
                next
            } else {
                m.clone()
            }
        })
        .collect()
}

fn settle_reaction(list: &[Message], temp_id: Uuid, created: &Reaction) -> Vec<Message> {
    list.iter()
        .map(|m| {
            if m.id == created.message_id {
                let mut next = m.clone();
                next.reactions.retain(|r| r.id != temp_id);
                if !next.reactions.iter().any(|r| r.id == created.id) {
                    next.reactions.push(created.clone());
                }
                next
            } else {
                m.clone()
            }
        })
        .collect()
}

fn remove_reaction_locally(
    list: &[Message],
    message_id: Uuid,
    user_id: Uuid,
    emoji: &str,
) -> Vec<Message> {
    list.iter()
        .map(|m| {
            if m.id == message_id {
                let mut next = m.clone();
                next.reactions
                    .retain(|r| !(r.user_id == user_id && r.emoji == emoji));
                next
            } else {
                m.clone()
            }
        })
        .collect()
}

/// Live view over one conversation: three realtime channels plus the
/// typing fan-out, released together when dropped.
pub struct ChatSession {
    chat_id: Uuid,
    messages: ChannelHandle,
    reactions: ChannelHandle,
    typing: ChannelHandle,
    typing_events: Arc<TypingEvents>,
}

impl ChatSession {
    pub fn chat_id(&self) -> Uuid {
        self.chat_id
    }

    /// Wait until all three channels are acknowledged by the server.
    pub async fn wait_subscribed(&mut self) -> Result<(), SyncError> {
        self.messages.wait_subscribed().await?;
        self.reactions.wait_subscribed().await?;
        self.typing.wait_subscribed().await?;
        Ok(())
    }

    pub fn messages_state(&self) -> ChannelState {
        self.messages.state()
    }

    pub fn messages_channel(&mut self) -> &mut ChannelHandle {
        &mut self.messages
    }

    pub fn reactions_channel(&mut self) -> &mut ChannelHandle {
        &mut self.reactions
    }

    pub fn typing_channel(&mut self) -> &mut ChannelHandle {
        &mut self.typing
    }

    /// Typing notifications for this chat.
    pub fn typing_events(&self) -> broadcast::Receiver<TypingEvent> {
        self.typing_events.subscribe(self.chat_id)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        // The channel handles unsubscribe themselves; reclaim the typing
        // fan-out slot if nobody else is listening.
        self.typing_events.forget(self.chat_id);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn project(id: u128) -> Project {
        Project {
            id: Uuid::from_u128(id),
            client_id: Uuid::from_u128(1),
            provider_id: None,
            category_id: Uuid::from_u128(2),
            title: "leaky faucet".to_string(),
            description: "kitchen sink drips".to_string(),
            budget: Some(120.0),
            location: None,
            status: ProjectStatus::Open,
            created_at: Utc::now(),
            category: None,
            client: None,
            provider: None,
            bids: Vec::new(),
        }
    }

    fn bid(id: u128, provider: u128) -> Bid {
        Bid {
            id: Uuid::from_u128(id),
            project_id: Uuid::from_u128(10),
            provider_id: Uuid::from_u128(provider),
            bid_amount: 100.0,
            message: None,
            status: BidStatus::Pending,
            created_at: Utc::now(),
            provider: None,
        }
    }

    fn message(id: u128, sender: u128, is_read: bool) -> Message {
        Message {
            id: Uuid::from_u128(id),
            chat_id: Uuid::from_u128(50),
            sender_id: Uuid::from_u128(sender),
            content: format!("message {id}"),
            is_read,
            created_at: Utc::now(),
            sender: None,
            reactions: Vec::new(),
        }
    }

    #[test]
    fn builder_derives_endpoint_urls() {
        let client = SyncClientBuilder::new("https://example.test/", "anon-key").build();
        let _ = client;

        assert_eq!(
            default_realtime_url("https://example.test"),
            "wss://example.test/realtime/v1"
        );
        assert_eq!(
            default_realtime_url("http://127.0.0.1:4000"),
            "ws://127.0.0.1:4000/realtime/v1"
        );
    }

    #[test]
    fn project_patch_projection_merges_fields() {
        let current = project(10);
        let patch = ProjectPatch {
            status: Some(ProjectStatus::Completed),
            title: Some("fixed faucet".to_string()),
            provider_id: Some(Some(Uuid::from_u128(7))),
            ..Default::default()
        };

        let next = apply_project_patch(&current, &patch);
        assert_eq!(next.status, ProjectStatus::Completed);
        assert_eq!(next.title, "fixed faucet");
        assert_eq!(next.provider_id, Some(Uuid::from_u128(7)));
        assert_eq!(next.description, current.description);
    }

    #[test]
    fn accept_projection_flips_all_bid_statuses_at_once() {
        let mut current = project(10);
        current.bids = vec![bid(20, 100), bid(21, 101), bid(22, 102)];

        let next = accept_bid_locally(&current, Uuid::from_u128(21), Uuid::from_u128(101));
        assert_eq!(next.status, ProjectStatus::InProgress);
        assert_eq!(next.provider_id, Some(Uuid::from_u128(101)));
        assert_eq!(next.bids[0].status, BidStatus::Rejected);
        assert_eq!(next.bids[1].status, BidStatus::Accepted);
        assert_eq!(next.bids[2].status, BidStatus::Rejected);
    }

    #[test]
    fn settling_a_sent_message_swaps_the_placeholder() {
        let temp_id = Uuid::from_u128(900);
        let mut placeholder = message(0, 1, false);
        placeholder.id = temp_id;
        let list = vec![message(1, 2, true), placeholder];

        let sent = message(5, 1, false);
        let next = settle_sent_message(&list, temp_id, &sent);
        assert_eq!(next.len(), 2);
        assert!(next.iter().all(|m| m.id != temp_id));
        assert!(next.iter().any(|m| m.id == sent.id));

        // If the feed already delivered the server row, settling must
        // not duplicate it.
        let again = settle_sent_message(&next, temp_id, &sent);
        assert_eq!(again.len(), 2);
    }

    #[test]
    fn settling_a_reaction_swaps_the_placeholder() {
        let temp_id = Uuid::from_u128(900);
        let mut with_temp = message(1, 2, true);
        with_temp.reactions.push(Reaction {
            id: temp_id,
            message_id: with_temp.id,
            user_id: Uuid::from_u128(3),
            emoji: "👍".to_string(),
            user: None,
        });

        let created = Reaction {
            id: Uuid::from_u128(40),
            message_id: Uuid::from_u128(1),
            user_id: Uuid::from_u128(3),
            emoji: "👍".to_string(),
            user: None,
        };

        let next = settle_reaction(&[with_temp], temp_id, &created);
        assert_eq!(next[0].reactions.len(), 1);
        assert_eq!(next[0].reactions[0].id, created.id);
    }

    #[test]
    fn mark_read_projection_skips_own_messages() {
        let reader = Uuid::from_u128(1);
        let list = vec![message(1, 1, false), message(2, 2, false), message(3, 2, true)];

        let next = mark_read_locally(&list, reader);
        assert!(!next[0].is_read, "own message stays as sent");
        assert!(next[1].is_read);
        assert!(next[2].is_read);
    }

    #[test]
    fn prepend_drops_an_existing_copy_of_the_row() {
        let list = vec![project(10), project(11)];
        let next = prepend_project(&list, &project(11));
        assert_eq!(next.len(), 2);
        assert_eq!(next[0].id, Uuid::from_u128(11));
    }
}

//! One function per remote operation.
//!
//! Every read returns fully parsed entity records with whatever
//! relationship expansions the operation needs; every write returns the
//! stored representation where the caller has a use for it. No retries
//! happen at this layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::StoreClient;
use crate::error::StoreError;
use crate::filter::{Filter, Order};
use crate::tables;
use crate::types::{
    Bid, BidPatch, Category, Chat, ChatParticipant, ChatSummary, Message, NewBid, NewCategory,
    NewMessage, NewProject, NewReaction, NewService, ProfilePatch, Project, ProjectFilters,
    ProjectPatch, ProviderFilters, Reaction, Service, ServicePatch, User,
};

/// Projection for project lists. The client relationship is
/// disambiguated because `projects` references `users` twice.
const PROJECT_LIST_SELECT: &str = "*,category:categories(*),client:users!projects_client_id_fkey(id,full_name,avatar_url,email),provider:provider_id(id,full_name,avatar_url,email),bids:project_bids(*,provider:users(id,full_name,avatar_url))";

/// Projection for a single project page; adds contact fields.
const PROJECT_DETAIL_SELECT: &str = "*,category:categories(*),client:users!projects_client_id_fkey(id,full_name,avatar_url,email,phone,location),provider:provider_id(id,full_name,avatar_url,email,phone,location),bids:project_bids(*,provider:users(id,full_name,avatar_url))";

const PROVIDER_SELECT: &str = "*,services:services(*,category:categories(*))";

const MESSAGE_SELECT: &str =
    "*,sender:users(id,full_name,avatar_url),reactions:message_reactions(*,user:users(id,full_name,avatar_url))";

const BID_SELECT: &str = "*,provider:users(id,full_name,avatar_url)";

const CHAT_SELECT: &str =
    "id,created_at,participants:chat_participants(chat_id,user_id,is_typing,user:users(id,full_name,avatar_url,email))";

const PARTICIPANT_SELECT: &str =
    "chat_id,user_id,is_typing,user:users(id,full_name,avatar_url,email)";

/// Typed operations against the remote row store.
#[derive(Debug, Clone)]
pub struct Gateway {
    store: StoreClient,
}

#[derive(Debug, Deserialize)]
struct ParticipantRow {
    chat_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct ChatRow {
    id: Uuid,
    created_at: DateTime<Utc>,
    #[serde(default)]
    participants: Vec<ChatParticipant>,
}

#[derive(Debug, Serialize)]
struct NewParticipant {
    chat_id: Uuid,
    user_id: Uuid,
}

impl Gateway {
    pub fn new(store: StoreClient) -> Self {
        Self { store }
    }

    pub async fn fetch_categories(&self) -> Result<Vec<Category>, StoreError> {
        self.store
            .select(
                tables::CATEGORIES,
                Filter::new().select("*").order("name", Order::Asc),
            )
            .await
    }

    /// Projects where the user is the client or the assigned provider,
    /// newest first, narrowed by the given filters.
    pub async fn fetch_projects(
        &self,
        user_id: Uuid,
        filters: &ProjectFilters,
    ) -> Result<Vec<Project>, StoreError> {
        let mut filter = Filter::new()
            .select(PROJECT_LIST_SELECT)
            .or(format!("client_id.eq.{user_id},provider_id.eq.{user_id}"));

        if let Some(status) = filters.status {
            filter = filter.eq("status", status);
        }
        if let Some(category_id) = filters.category_id {
            filter = filter.eq("category_id", category_id);
        }
        if let Some(search) = &filters.search {
            filter = filter.ilike("title", format!("*{search}*"));
        }

        self.store
            .select(
                tables::PROJECTS,
                filter.order("created_at", Order::Desc),
            )
            .await
    }

    pub async fn fetch_project(&self, project_id: Uuid) -> Result<Project, StoreError> {
        self.store
            .select_one(
                tables::PROJECTS,
                &project_id.to_string(),
                Filter::new()
                    .select(PROJECT_DETAIL_SELECT)
                    .eq("id", project_id),
            )
            .await
    }

    pub async fn fetch_providers(
        &self,
        filters: &ProviderFilters,
    ) -> Result<Vec<User>, StoreError> {
        let mut filter = Filter::new().select(PROVIDER_SELECT).eq("is_provider", true);

        if let Some(location) = &filters.location {
            filter = filter.ilike("location", format!("*{location}*"));
        }
        if let Some(search) = &filters.search {
            filter = filter.or(format!("full_name.ilike.*{search}*,bio.ilike.*{search}*"));
        }

        self.store.select(tables::USERS, filter).await
    }

    pub async fn fetch_user(&self, user_id: Uuid) -> Result<User, StoreError> {
        self.store
            .select_one(
                tables::USERS,
                &user_id.to_string(),
                Filter::new().select("*").eq("id", user_id),
            )
            .await
    }

    /// The user's conversation list: one summary per chat with the other
    /// participant, the latest message, and the unread count. Derived
    /// client-side from three reads because the store cannot aggregate
    /// per-chat.
    pub async fn fetch_chat_summaries(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ChatSummary>, StoreError> {
        let memberships: Vec<ParticipantRow> = self
            .store
            .select(
                tables::CHAT_PARTICIPANTS,
                Filter::new().select("chat_id").eq("user_id", user_id),
            )
            .await?;

        let chat_ids: Vec<Uuid> = memberships.iter().map(|m| m.chat_id).collect();
        if chat_ids.is_empty() {
            return Ok(Vec::new());
        }

        let chats: Vec<ChatRow> = self
            .store
            .select(
                tables::CHATS,
                Filter::new()
                    .select(CHAT_SELECT)
                    .is_in("id", chat_ids.iter())
                    .order("created_at", Order::Desc),
            )
            .await?;

        let messages: Vec<Message> = self
            .store
            .select(
                tables::MESSAGES,
                Filter::new()
                    .select("*")
                    .is_in("chat_id", chat_ids.iter())
                    .order("created_at", Order::Desc),
            )
            .await?;

        let summaries = chats
            .into_iter()
            .map(|chat| {
                let other_participant = chat
                    .participants
                    .into_iter()
                    .find(|p| p.user_id != user_id)
                    .and_then(|p| p.user);
                let last_message = messages.iter().find(|m| m.chat_id == chat.id).cloned();
                let unread_count = messages
                    .iter()
                    .filter(|m| m.chat_id == chat.id && m.sender_id != user_id && !m.is_read)
                    .count() as u32;

                ChatSummary {
                    id: chat.id,
                    created_at: chat.created_at,
                    other_participant,
                    last_message,
                    unread_count,
                }
            })
            .collect();

        Ok(summaries)
    }

    /// All messages in a chat, oldest first, with sender and reactions
    /// expanded.
    pub async fn fetch_messages(&self, chat_id: Uuid) -> Result<Vec<Message>, StoreError> {
        self.store
            .select(
                tables::MESSAGES,
                Filter::new()
                    .select(MESSAGE_SELECT)
                    .eq("chat_id", chat_id)
                    .order("created_at", Order::Asc),
            )
            .await
    }

    pub async fn fetch_chat_participants(
        &self,
        chat_id: Uuid,
    ) -> Result<Vec<ChatParticipant>, StoreError> {
        self.store
            .select(
                tables::CHAT_PARTICIPANTS,
                Filter::new()
                    .select(PARTICIPANT_SELECT)
                    .eq("chat_id", chat_id),
            )
            .await
    }

    pub async fn create_category(&self, category: &NewCategory) -> Result<Category, StoreError> {
        self.store
            .insert(tables::CATEGORIES, category, Filter::new().select("*"))
            .await
    }

    /// Insert a project and return it with list expansions, so callers
    /// can splice it into cached lists without a refetch.
    pub async fn create_project(&self, project: &NewProject) -> Result<Project, StoreError> {
        self.store
            .insert(
                tables::PROJECTS,
                project,
                Filter::new().select(PROJECT_LIST_SELECT),
            )
            .await
    }

    pub async fn update_project(
        &self,
        project_id: Uuid,
        patch: &ProjectPatch,
    ) -> Result<Project, StoreError> {
        let rows: Vec<Project> = self
            .store
            .update(
                tables::PROJECTS,
                Filter::new()
                    .select(PROJECT_LIST_SELECT)
                    .eq("id", project_id),
                patch,
            )
            .await?;

        rows.into_iter().next().ok_or_else(|| StoreError::NotFound {
            table: tables::PROJECTS.to_string(),
            id: Some(project_id.to_string()),
        })
    }

    pub async fn create_bid(&self, bid: &NewBid) -> Result<Bid, StoreError> {
        self.store
            .insert(tables::PROJECT_BIDS, bid, Filter::new().select(BID_SELECT))
            .await
    }

    pub async fn update_bid(&self, bid_id: Uuid, patch: &BidPatch) -> Result<Bid, StoreError> {
        let rows: Vec<Bid> = self
            .store
            .update(
                tables::PROJECT_BIDS,
                Filter::new().select(BID_SELECT).eq("id", bid_id),
                patch,
            )
            .await?;

        rows.into_iter().next().ok_or_else(|| StoreError::NotFound {
            table: tables::PROJECT_BIDS.to_string(),
            id: Some(bid_id.to_string()),
        })
    }

    /// Mark every bid on a project rejected except the accepted one.
    pub async fn reject_other_bids(
        &self,
        project_id: Uuid,
        accepted_bid_id: Uuid,
    ) -> Result<(), StoreError> {
        self.store
            .update_minimal(
                tables::PROJECT_BIDS,
                Filter::new()
                    .eq("project_id", project_id)
                    .neq("id", accepted_bid_id),
                &serde_json::json!({ "status": "rejected" }),
            )
            .await
    }

    pub async fn update_user(
        &self,
        user_id: Uuid,
        patch: &ProfilePatch,
    ) -> Result<User, StoreError> {
        let rows: Vec<User> = self
            .store
            .update(
                tables::USERS,
                Filter::new().select("*").eq("id", user_id),
                patch,
            )
            .await?;

        rows.into_iter().next().ok_or_else(|| StoreError::NotFound {
            table: tables::USERS.to_string(),
            id: Some(user_id.to_string()),
        })
    }

    pub async fn create_service(&self, service: &NewService) -> Result<Service, StoreError> {
        self.store
            .insert(
                tables::SERVICES,
                service,
                Filter::new().select("*,category:categories(*)"),
            )
            .await
    }

    pub async fn update_service(
        &self,
        service_id: Uuid,
        patch: &ServicePatch,
    ) -> Result<Service, StoreError> {
        let rows: Vec<Service> = self
            .store
            .update(
                tables::SERVICES,
                Filter::new()
                    .select("*,category:categories(*)")
                    .eq("id", service_id),
                patch,
            )
            .await?;

        rows.into_iter().next().ok_or_else(|| StoreError::NotFound {
            table: tables::SERVICES.to_string(),
            id: Some(service_id.to_string()),
        })
    }

    /// Return the chat shared by the two users, creating it (and both
    /// membership rows) when none exists yet.
    pub async fn find_or_create_chat(
        &self,
        user_id: Uuid,
        other_id: Uuid,
    ) -> Result<Chat, StoreError> {
        let mine: Vec<ParticipantRow> = self
            .store
            .select(
                tables::CHAT_PARTICIPANTS,
                Filter::new().select("chat_id").eq("user_id", user_id),
            )
            .await?;

        if !mine.is_empty() {
            let chat_ids: Vec<Uuid> = mine.iter().map(|m| m.chat_id).collect();
            let shared: Vec<ParticipantRow> = self
                .store
                .select(
                    tables::CHAT_PARTICIPANTS,
                    Filter::new()
                        .select("chat_id")
                        .eq("user_id", other_id)
                        .is_in("chat_id", chat_ids.iter())
                        .limit(1),
                )
                .await?;

            if let Some(existing) = shared.first() {
                return self.fetch_chat(existing.chat_id).await;
            }
        }

        let chat: Chat = self
            .store
            .insert(
                tables::CHATS,
                &serde_json::json!({}),
                Filter::new().select("*"),
            )
            .await?;

        let participants = [
            NewParticipant {
                chat_id: chat.id,
                user_id,
            },
            NewParticipant {
                chat_id: chat.id,
                user_id: other_id,
            },
        ];
        self.store
            .insert_minimal(tables::CHAT_PARTICIPANTS, &participants)
            .await?;

        Ok(chat)
    }

    async fn fetch_chat(&self, chat_id: Uuid) -> Result<Chat, StoreError> {
        self.store
            .select_one(
                tables::CHATS,
                &chat_id.to_string(),
                Filter::new().select("id,created_at").eq("id", chat_id),
            )
            .await
    }

    pub async fn send_message(&self, message: &NewMessage) -> Result<Message, StoreError> {
        self.store
            .insert(tables::MESSAGES, message, Filter::new().select(MESSAGE_SELECT))
            .await
    }

    /// Mark every message in the chat that someone else sent as read.
    pub async fn mark_messages_read(
        &self,
        chat_id: Uuid,
        reader_id: Uuid,
    ) -> Result<(), StoreError> {
        self.store
            .update_minimal(
                tables::MESSAGES,
                Filter::new()
                    .eq("chat_id", chat_id)
                    .neq("sender_id", reader_id)
                    .eq("is_read", false),
                &serde_json::json!({ "is_read": true }),
            )
            .await
    }

    pub async fn add_reaction(&self, reaction: &NewReaction) -> Result<Reaction, StoreError> {
        self.store
            .insert(
                tables::MESSAGE_REACTIONS,
                reaction,
                Filter::new().select("*,user:users(id,full_name,avatar_url)"),
            )
            .await
    }

    pub async fn remove_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> Result<(), StoreError> {
        self.store
            .delete(
                tables::MESSAGE_REACTIONS,
                Filter::new()
                    .eq("message_id", message_id)
                    .eq("user_id", user_id)
                    .eq("emoji", emoji),
            )
            .await
    }

    /// Publish the user's typing state on a chat. Best-effort; callers
    /// treat failures as non-fatal.
    pub async fn set_typing(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    ) -> Result<(), StoreError> {
        self.store
            .update_minimal(
                tables::CHAT_PARTICIPANTS,
                Filter::new().eq("chat_id", chat_id).eq("user_id", user_id),
                &serde_json::json!({ "is_typing": is_typing }),
            )
            .await
    }
}

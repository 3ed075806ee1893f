//! Entity records exchanged with the remote row store.
//!
//! Row shapes are parsed at the gateway boundary; nothing downstream of
//! this crate handles untyped JSON. Nested fields (`category`, `client`,
//! `bids`, ...) are populated only when the query expands the
//! relationship, so they default to empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a posted project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Open,
    InProgress,
    Completed,
    Cancelled,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Open => "open",
            ProjectStatus::InProgress => "in_progress",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a bid on a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
}

impl BidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BidStatus::Pending => "pending",
            BidStatus::Accepted => "accepted",
            BidStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for BidStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Abbreviated user row as expanded into other records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub full_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

/// Full user row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub is_provider: bool,
    pub created_at: DateTime<Utc>,
    /// Offered services, present when the query expands them.
    #[serde(default)]
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// A service offering listed by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub category_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub category: Option<Category>,
}

/// A project posted by a client, optionally with expanded relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub client_id: Uuid,
    /// Set once a bid has been accepted.
    #[serde(default)]
    pub provider_id: Option<Uuid>,
    pub category_id: Uuid,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub budget: Option<f64>,
    #[serde(default)]
    pub location: Option<String>,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub client: Option<UserSummary>,
    #[serde(default)]
    pub provider: Option<UserSummary>,
    #[serde(default)]
    pub bids: Vec<Bid>,
}

/// A provider's bid on a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub id: Uuid,
    pub project_id: Uuid,
    pub provider_id: Uuid,
    pub bid_amount: f64,
    #[serde(default)]
    pub message: Option<String>,
    pub status: BidStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub provider: Option<UserSummary>,
}

/// A two-party conversation. Membership lives in `chat_participants`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatParticipant {
    pub chat_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default)]
    pub user: Option<UserSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sender: Option<UserSummary>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: Uuid,
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub emoji: String,
    #[serde(default)]
    pub user: Option<UserSummary>,
}

/// One entry in a user's conversation list, derived from chat,
/// participant, and message rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub other_participant: Option<UserSummary>,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
}

/// Insert payload for `projects`. Status defaults to `open` server-side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewProject {
    pub client_id: Uuid,
    pub category_id: Uuid,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Partial update for `projects`. Absent fields leave the column
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ProjectStatus>,
    /// Outer `None` leaves the column untouched; `Some(None)` clears it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<Option<Uuid>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Insert payload for `project_bids`. Status defaults to `pending`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewBid {
    pub project_id: Uuid,
    pub provider_id: Uuid,
    pub bid_amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Partial update for `project_bids`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BidPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BidStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Insert payload for `messages`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewMessage {
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub is_read: bool,
}

/// Insert payload for `message_reactions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewReaction {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub emoji: String,
}

/// Partial update for `users`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_provider: Option<bool>,
}

/// Insert payload for `services`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewService {
    pub provider_id: Uuid,
    pub category_id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

/// Partial update for `services`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServicePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

/// Insert payload for `categories`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewCategory {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Narrowing criteria for project list queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectFilters {
    pub status: Option<ProjectStatus>,
    pub category_id: Option<Uuid>,
    /// Case-insensitive substring match on the title.
    pub search: Option<String>,
}

impl ProjectFilters {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.category_id.is_none() && self.search.is_none()
    }
}

/// Narrowing criteria for provider list queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderFilters {
    /// Case-insensitive substring match on the location.
    pub location: Option<String>,
    /// Case-insensitive substring match on name or bio.
    pub search: Option<String>,
}

impl ProviderFilters {
    pub fn is_empty(&self) -> bool {
        self.location.is_none() && self.search.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn project_parses_with_expanded_relations() {
        let json = r#"{
            "id": "4a3f8b2e-9c1d-4e5f-8a7b-6c5d4e3f2a1b",
            "client_id": "11111111-2222-3333-4444-555555555555",
            "provider_id": null,
            "category_id": "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee",
            "title": "Fix kitchen sink",
            "description": "Leaking under the basin",
            "budget": 150.0,
            "location": "Portland, OR",
            "status": "open",
            "created_at": "2024-03-01T12:00:00+00:00",
            "category": {
                "id": "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee",
                "name": "Plumbing"
            },
            "client": {
                "id": "11111111-2222-3333-4444-555555555555",
                "full_name": "Dana Client",
                "avatar_url": null,
                "email": "dana@example.com"
            },
            "bids": [
                {
                    "id": "99999999-8888-7777-6666-555555555555",
                    "project_id": "4a3f8b2e-9c1d-4e5f-8a7b-6c5d4e3f2a1b",
                    "provider_id": "66666666-7777-8888-9999-000000000000",
                    "bid_amount": 120.5,
                    "message": "Can do it Tuesday",
                    "status": "pending",
                    "created_at": "2024-03-02T09:00:00+00:00",
                    "provider": {
                        "id": "66666666-7777-8888-9999-000000000000",
                        "full_name": "Pat Provider",
                        "avatar_url": null
                    }
                }
            ]
        }"#;

        let project: Project = serde_json::from_str(json).unwrap();
        assert_eq!(project.status, ProjectStatus::Open);
        assert_eq!(project.title, "Fix kitchen sink");
        assert_eq!(project.bids.len(), 1);
        assert_eq!(project.bids[0].status, BidStatus::Pending);
        assert_eq!(
            project.bids[0].provider.as_ref().unwrap().full_name,
            "Pat Provider"
        );
        assert_eq!(project.category.as_ref().unwrap().name, "Plumbing");
        assert!(project.provider.is_none());
    }

    #[test]
    fn project_parses_without_expansions() {
        let json = r#"{
            "id": "4a3f8b2e-9c1d-4e5f-8a7b-6c5d4e3f2a1b",
            "client_id": "11111111-2222-3333-4444-555555555555",
            "category_id": "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee",
            "title": "Fix kitchen sink",
            "description": "Leaking under the basin",
            "status": "in_progress",
            "created_at": "2024-03-01T12:00:00Z"
        }"#;

        let project: Project = serde_json::from_str(json).unwrap();
        assert_eq!(project.status, ProjectStatus::InProgress);
        assert!(project.bids.is_empty());
        assert!(project.category.is_none());
        assert!(project.budget.is_none());
    }

    #[test]
    fn project_patch_skips_absent_fields() {
        let patch = ProjectPatch {
            status: Some(ProjectStatus::InProgress),
            provider_id: Some(Some(
                "66666666-7777-8888-9999-000000000000".parse().unwrap(),
            )),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "in_progress",
                "provider_id": "66666666-7777-8888-9999-000000000000"
            })
        );
    }

    #[test]
    fn project_patch_clears_provider_with_null() {
        let patch = ProjectPatch {
            status: Some(ProjectStatus::Open),
            provider_id: Some(None),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "status": "open", "provider_id": null })
        );
    }

    #[test]
    fn message_parses_with_reactions() {
        let json = r#"{
            "id": "99999999-8888-7777-6666-555555555555",
            "chat_id": "11111111-2222-3333-4444-555555555555",
            "sender_id": "66666666-7777-8888-9999-000000000000",
            "content": "On my way",
            "is_read": false,
            "created_at": "2024-03-02T09:00:00+00:00",
            "reactions": [
                {
                    "id": "12121212-3434-5656-7878-909090909090",
                    "message_id": "99999999-8888-7777-6666-555555555555",
                    "user_id": "11111111-2222-3333-4444-555555555555",
                    "emoji": "👍"
                }
            ]
        }"#;

        let message: Message = serde_json::from_str(json).unwrap();
        assert_eq!(message.reactions.len(), 1);
        assert_eq!(message.reactions[0].emoji, "👍");
        assert!(!message.is_read);
    }
}

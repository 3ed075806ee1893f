//! Table names in the remote row store.

pub const USERS: &str = "users";
pub const PROJECTS: &str = "projects";
pub const PROJECT_BIDS: &str = "project_bids";
pub const SERVICES: &str = "services";
pub const CATEGORIES: &str = "categories";
pub const CHATS: &str = "chats";
pub const MESSAGES: &str = "messages";
pub const MESSAGE_REACTIONS: &str = "message_reactions";
pub const CHAT_PARTICIPANTS: &str = "chat_participants";

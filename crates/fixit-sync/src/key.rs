//! Cache keys.
//!
//! A [`QueryKey`] is an ordered tuple of parts; two keys address the same
//! cache slot exactly when their parts are equal in order. [`TypedKey`]
//! carries the value type of the slot so reads and patches stay
//! statically typed. Constructors for every query this crate caches live
//! in [`keys`].

use std::fmt;
use std::marker::PhantomData;

use uuid::Uuid;

pub const TAG_CATEGORIES: &str = "categories";
pub const TAG_PROJECTS: &str = "projects";
pub const TAG_PROJECT: &str = "project";
pub const TAG_PROVIDERS: &str = "providers";
pub const TAG_PROFILE: &str = "profile";
pub const TAG_CHATS: &str = "chats";
pub const TAG_MESSAGES: &str = "messages";

/// One element of a key tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Tag(&'static str),
    Id(Uuid),
    Text(String),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Tag(tag) => f.write_str(tag),
            KeyPart::Id(id) => write!(f, "{id}"),
            KeyPart::Text(text) => f.write_str(text),
        }
    }
}

/// Identifier for one cached query result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    parts: Vec<KeyPart>,
}

impl QueryKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self { parts }
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// The leading tag, when the key starts with one.
    pub fn tag(&self) -> Option<&'static str> {
        match self.parts.first() {
            Some(KeyPart::Tag(tag)) => Some(tag),
            _ => None,
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

/// A [`QueryKey`] whose slot holds values of type `T`.
///
/// The phantom type never stores a `T`, it only pins what the slot may be
/// read and written as.
pub struct TypedKey<T> {
    key: QueryKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedKey<T> {
    pub fn new(key: QueryKey) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn into_key(self) -> QueryKey {
        self.key
    }
}

impl<T> Clone for TypedKey<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for TypedKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypedKey").field(&self.key).finish()
    }
}

impl<T> PartialEq for TypedKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for TypedKey<T> {}

impl<T> fmt::Display for TypedKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// Selects cache entries for invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    /// Matches exactly one key.
    Exact(QueryKey),
    /// Matches every key starting with these parts.
    Prefix(Vec<KeyPart>),
}

impl KeyPattern {
    pub fn exact(key: QueryKey) -> Self {
        KeyPattern::Exact(key)
    }

    /// Every key under a tag, e.g. all projects lists.
    pub fn tag(tag: &'static str) -> Self {
        KeyPattern::Prefix(vec![KeyPart::Tag(tag)])
    }

    pub fn prefix(parts: Vec<KeyPart>) -> Self {
        KeyPattern::Prefix(parts)
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            KeyPattern::Exact(exact) => exact == key,
            KeyPattern::Prefix(parts) => {
                key.parts().len() >= parts.len() && key.parts()[..parts.len()] == parts[..]
            }
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::Exact(key) => write!(f, "{key}"),
            KeyPattern::Prefix(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str("/")?;
                    }
                    write!(f, "{part}")?;
                }
                f.write_str("/*")
            }
        }
    }
}

/// Key constructors for every query the sync layer caches.
pub mod keys {
    use fixit_store::{
        Category, ChatSummary, Message, Project, ProjectFilters, ProviderFilters, User,
    };
    use uuid::Uuid;

    use super::*;

    pub fn categories() -> TypedKey<Vec<Category>> {
        TypedKey::new(QueryKey::new(vec![KeyPart::Tag(TAG_CATEGORIES)]))
    }

    pub fn projects(user_id: Uuid, filters: &ProjectFilters) -> TypedKey<Vec<Project>> {
        let mut parts = vec![KeyPart::Tag(TAG_PROJECTS), KeyPart::Id(user_id)];
        parts.extend(project_filter_parts(filters));
        TypedKey::new(QueryKey::new(parts))
    }

    pub fn project(project_id: Uuid) -> TypedKey<Project> {
        TypedKey::new(QueryKey::new(vec![
            KeyPart::Tag(TAG_PROJECT),
            KeyPart::Id(project_id),
        ]))
    }

    pub fn providers(filters: &ProviderFilters) -> TypedKey<Vec<User>> {
        let mut parts = vec![KeyPart::Tag(TAG_PROVIDERS)];
        parts.extend(provider_filter_parts(filters));
        TypedKey::new(QueryKey::new(parts))
    }

    pub fn profile(user_id: Uuid) -> TypedKey<User> {
        TypedKey::new(QueryKey::new(vec![
            KeyPart::Tag(TAG_PROFILE),
            KeyPart::Id(user_id),
        ]))
    }

    pub fn chats(user_id: Uuid) -> TypedKey<Vec<ChatSummary>> {
        TypedKey::new(QueryKey::new(vec![
            KeyPart::Tag(TAG_CHATS),
            KeyPart::Id(user_id),
        ]))
    }

    pub fn messages(chat_id: Uuid) -> TypedKey<Vec<Message>> {
        TypedKey::new(QueryKey::new(vec![
            KeyPart::Tag(TAG_MESSAGES),
            KeyPart::Id(chat_id),
        ]))
    }

    /// Canonical key parts for project filters, one part per set field.
    /// Distinct filter sets must produce distinct parts or two logical
    /// queries would share a slot; keeping each field in its own part
    /// means free text in one field can never imitate another.
    fn project_filter_parts(filters: &ProjectFilters) -> Vec<KeyPart> {
        if filters.is_empty() {
            return vec![KeyPart::Text("all".to_string())];
        }
        let mut parts = Vec::new();
        if let Some(status) = filters.status {
            parts.push(KeyPart::Text(format!("status:{}", status.as_str())));
        }
        if let Some(category) = filters.category_id {
            parts.push(KeyPart::Text(format!("category:{category}")));
        }
        if let Some(search) = filters.search.as_deref() {
            parts.push(KeyPart::Text(format!("search:{search}")));
        }
        parts
    }

    fn provider_filter_parts(filters: &ProviderFilters) -> Vec<KeyPart> {
        if filters.is_empty() {
            return vec![KeyPart::Text("all".to_string())];
        }
        let mut parts = Vec::new();
        if let Some(location) = filters.location.as_deref() {
            parts.push(KeyPart::Text(format!("location:{location}")));
        }
        if let Some(search) = filters.search.as_deref() {
            parts.push(KeyPart::Text(format!("search:{search}")));
        }
        parts
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{data::Collections, machinery::store::{Key, PartialKey}};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: u64,
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn key(user_id: &str, id: u64) -> Key<Self> {
        Key::scoped(Collections::Notification, user_id, format!("{id:020}"))
    }

    pub fn partial_key(user_id: &str) -> PartialKey<Self> {
        PartialKey::scoped(Collections::Notification, user_id)
    }
}

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    error::{RequestError, RequestResult},
    machinery::store::Store,
    resources::{identity::Identity, notification::Notification},
};

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// Hands mail to an HTTP relay as `{to, subject, body}`.
pub struct RelayMailer {
    client: Client,
    url: String,
}

impl RelayMailer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Mailer for RelayMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "to": to, "subject": subject, "body": body }))
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("mail relay answered {}", response.status());
        }
        Ok(())
    }
}

pub struct Notifier {
    store: Arc<Store>,
    mailer: Option<Arc<dyn Mailer>>,
}

impl Notifier {
    pub fn new(store: Arc<Store>, mailer: Option<Arc<dyn Mailer>>) -> Self {
        Self { store, mailer }
    }

    pub fn notify(&self, user_id: &str, title: &str, body: &str) -> Result<Notification> {
        let notification = self.store.write(|txn| {
            let notification = Notification {
                id: txn.next_sequence("notification")?,
                user_id: user_id.to_string(),
                title: title.to_string(),
                body: body.to_string(),
                read: false,
                created_at: Utc::now(),
            };
            txn.put(
                &Notification::key(user_id, notification.id),
                &notification,
            )?;
            Ok(notification)
        })?;

        info!("notified {}: {}", user_id, title);
        Ok(notification)
    }

    /// Persists the notification and, if the user has an address on file, mails it too.
    /// Mail failures are logged only.
    pub async fn notify_user(&self, identity: &Identity, title: &str, body: &str) {
        if let Err(e) = self.notify(&identity.user_id, title, body) {
            warn!("failed to store notification for {}: {}", identity.user_id, e);
        }

        let (Some(mailer), Some(email)) = (&self.mailer, &identity.email) else {
            return;
        };
        if let Err(e) = mailer.send(email, title, body).await {
            warn!("failed to mail {}: {}", email, e);
        }
    }

    /// Newest first.
    pub fn list(&self, user_id: &str) -> Result<Vec<Notification>> {
        let mut notifications = self.store.list(&Notification::partial_key(user_id))?;
        notifications.reverse();
        Ok(notifications)
    }

    pub fn toggle_read(&self, user_id: &str, id: u64) -> RequestResult<Notification> {
        self.store.try_write(|txn| {
            let key = Notification::key(user_id, id);
            let Some(mut notification) = txn.get(&key)? else {
                return Err(RequestError::NotFound);
            };
            notification.read = !notification.read;
            txn.put(&key, &notification)?;
            Ok(notification)
        })
    }
}

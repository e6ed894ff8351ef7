use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::platform::{Platform, PlatformError, PlatformSession, Template};

struct CachedSession {
    session: PlatformSession,
    checked_at: Instant,
}

struct CachedTemplates {
    templates: Vec<Template>,
    fetched_at: Instant,
}

/// Process wide platform session and template list. Concurrent refreshes are not
/// serialised; whichever finishes last is kept.
pub struct PlatformSessionCache {
    platform: Arc<dyn Platform>,
    session: RwLock<Option<CachedSession>>,
    templates: RwLock<Option<CachedTemplates>>,
    check_interval: Duration,
    template_ttl: Duration,
}

impl PlatformSessionCache {
    pub fn new(
        platform: Arc<dyn Platform>,
        check_interval: Duration,
        template_ttl: Duration,
    ) -> Self {
        Self {
            platform,
            session: RwLock::new(None),
            templates: RwLock::new(None),
            check_interval,
            template_ttl,
        }
    }

    pub fn platform(&self) -> Arc<dyn Platform> {
        self.platform.clone()
    }

    /// Returns the cached session, revalidating it once `check_interval` has passed.
    pub async fn get(&self) -> Result<PlatformSession, PlatformError> {
        let cached = {
            let guard = self.session.read().await;
            guard
                .as_ref()
                .map(|c| (c.session.clone(), c.checked_at.elapsed() < self.check_interval))
        };

        match cached {
            Some((session, true)) => Ok(session),
            Some((session, false)) => {
                if self.platform.session_valid(&session).await? {
                    let mut guard = self.session.write().await;
                    if let Some(cached) = guard.as_mut().filter(|c| c.session == session) {
                        cached.checked_at = Instant::now();
                    }
                    Ok(session)
                } else {
                    debug!("platform session expired");
                    self.refresh().await
                }
            }
            None => self.refresh().await,
        }
    }

    pub async fn refresh(&self) -> Result<PlatformSession, PlatformError> {
        let session = self.platform.create_session().await?;
        info!("created new platform session");

        *self.session.write().await = Some(CachedSession {
            session: session.clone(),
            checked_at: Instant::now(),
        });

        Ok(session)
    }

    pub async fn invalidate(&self) {
        *self.session.write().await = None;
    }

    /// Runs `f` with a session, retrying once with a fresh one if the platform reports
    /// the session as no longer valid.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T, PlatformError>
    where
        F: Fn(Arc<dyn Platform>, PlatformSession) -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let session = self.get().await?;
        match f(self.platform.clone(), session).await {
            Err(PlatformError::Unauthorized) => {
                warn!("platform rejected cached session, retrying with a new one");
                self.invalidate().await;
                let session = self.refresh().await?;
                f(self.platform.clone(), session).await
            }
            result => result,
        }
    }

    pub async fn templates(&self) -> Result<Vec<Template>, PlatformError> {
        {
            let guard = self.templates.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.fetched_at.elapsed() < self.template_ttl {
                    return Ok(cached.templates.clone());
                }
            }
        }

        self.refresh_templates().await
    }

    pub async fn refresh_templates(&self) -> Result<Vec<Template>, PlatformError> {
        let templates = self
            .call(|platform, session| async move { platform.list_templates(&session).await })
            .await?;
        info!("loaded {} templates", templates.len());

        *self.templates.write().await = Some(CachedTemplates {
            templates: templates.clone(),
            fetched_at: Instant::now(),
        });

        Ok(templates)
    }

    pub async fn template_names(&self) -> Result<Vec<String>, PlatformError> {
        Ok(self.templates().await?.into_iter().map(|t| t.name).collect())
    }

    pub async fn template_id(&self, name: &str) -> Result<String, PlatformError> {
        self.templates()
            .await?
            .into_iter()
            .find(|t| t.name == name)
            .map(|t| t.id)
            .ok_or_else(|| PlatformError::UnknownTemplate(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::testing::FakePlatform;

    fn cache(platform: Arc<FakePlatform>, check_interval: Duration) -> PlatformSessionCache {
        PlatformSessionCache::new(platform, check_interval, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_session_is_reused() {
        let platform = Arc::new(FakePlatform::default());
        let cache = cache(platform.clone(), Duration::from_secs(60));

        let first = cache.get().await.unwrap();
        let second = cache.get().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(platform.sessions_created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_session_is_replaced() {
        let platform = Arc::new(FakePlatform::default());
        let cache = cache(platform.clone(), Duration::ZERO);

        let first = cache.get().await.unwrap();
        platform.expire_sessions();
        let second = cache.get().await.unwrap();

        assert_ne!(first, second);
        assert_eq!(platform.sessions_created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_call_retries_once_on_unauthorized() {
        let platform = Arc::new(FakePlatform::default());
        let cache = cache(platform.clone(), Duration::from_secs(60));

        cache.get().await.unwrap();
        // the cache still believes in the old session
        platform.expire_sessions();

        let vms = cache
            .call(|platform, session| async move { platform.list_vms(&session).await })
            .await
            .unwrap();
        assert!(vms.is_empty());
        assert_eq!(platform.sessions_created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_templates_are_cached() {
        let platform = Arc::new(FakePlatform::default());
        let cache = cache(platform.clone(), Duration::from_secs(60));

        assert_eq!(cache.template_names().await.unwrap(), vec!["UBUNTU".to_string()]);
        platform.add_template("DEBIAN");
        assert_eq!(cache.template_names().await.unwrap(), vec!["UBUNTU".to_string()]);

        cache.refresh_templates().await.unwrap();
        assert_eq!(cache.template_names().await.unwrap().len(), 2);
        assert!(matches!(
            cache.template_id("WINDOWS").await,
            Err(PlatformError::UnknownTemplate(_))
        ));
    }
}

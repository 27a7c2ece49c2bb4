//! Session Manager: provider-id lifecycle and health-driven expiry, wrapping a provider
//! adapter with a lock deliberately separate from the adapter's own capacity/instance lock
//! so the reaper can never invert lock order against a Deploy/Undeploy in flight.

use super::ProviderAdapter;
use crate::error::{OrchestratorError, Result};
use crate::model::{Capacity, ResourceTags};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, Duration};

#[derive(Debug, Clone)]
struct SessionState {
    provider_id: String,
    created_at: DateTime<Utc>,
    last_health_at: DateTime<Utc>,
}

pub struct SessionManager {
    adapter: Arc<dyn ProviderAdapter>,
    session: Arc<RwLock<Option<SessionState>>>,
    session_ttl: ChronoDuration,
}

impl SessionManager {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, session_ttl_s: i64) -> Self {
        Self {
            adapter,
            session: Arc::new(RwLock::new(None)),
            session_ttl: ChronoDuration::seconds(session_ttl_s),
        }
    }

    pub async fn set_provider_id(&self, provider_id: impl Into<String>) {
        let now = Utc::now();
        let mut session = self.session.write().await;
        *session = Some(SessionState {
            provider_id: provider_id.into(),
            created_at: now,
            last_health_at: now,
        });
    }

    pub async fn clear_provider_id(&self) {
        let mut session = self.session.write().await;
        *session = None;
    }

    pub async fn get_provider_id(&self) -> Option<String> {
        self.session.read().await.as_ref().map(|s| s.provider_id.clone())
    }

    pub async fn update_health(&self) {
        let mut session = self.session.write().await;
        if let Some(s) = session.as_mut() {
            s.last_health_at = Utc::now();
        }
    }

    pub async fn is_live(&self) -> bool {
        match self.session.read().await.as_ref() {
            Some(s) => Utc::now() - s.last_health_at <= self.session_ttl,
            None => false,
        }
    }

    /// The provider id allowed to act right now, or an `Auth` error if no session was ever
    /// established or the health pulse has gone stale past the TTL (the reaper may not have
    /// run yet, but a caller must not be let through on borrowed time).
    pub async fn authorize(&self) -> Result<String> {
        let session = self.session.read().await;
        match session.as_ref() {
            Some(s) if Utc::now() - s.last_health_at <= self.session_ttl => Ok(s.provider_id.clone()),
            Some(_) => Err(OrchestratorError::Auth(
                "session expired; call HealthCheck to re-establish it before retrying".to_string(),
            )),
            None => Err(OrchestratorError::Auth("no active session; call Connect first".to_string())),
        }
    }

    /// On-demand liveness pulse: authenticates against the adapter under the current
    /// provider id and, on success, resets the health clock — re-establishing a session
    /// the reaper has not yet cleared, without requiring a fresh Connect.
    pub async fn health_check(&self) -> Result<(Capacity, ResourceTags)> {
        let provider_id = self
            .get_provider_id()
            .await
            .ok_or_else(|| OrchestratorError::Auth("no active session; call Connect first".to_string()))?;
        let result = self.adapter.health_check(&provider_id).await?;
        self.update_health().await;
        Ok(result)
    }

    /// Long-lived reaper task: every `check_interval`, clear sessions whose health pulse
    /// is older than the TTL. The timeout hook (adapter.disconnect) MUST NOT and does not
    /// destroy instances — that remains an explicit Undeploy or backend-owned teardown.
    pub async fn run_reaper(self: Arc<Self>, check_interval: Duration, mut stop: watch::Receiver<bool>) {
        let mut tick = interval(check_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.reap_if_expired().await;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn reap_if_expired(&self) {
        let expired_provider_id = {
            let session = self.session.read().await;
            match session.as_ref() {
                Some(s) if Utc::now() - s.last_health_at > self.session_ttl => Some(s.provider_id.clone()),
                _ => None,
            }
        };
        let Some(provider_id) = expired_provider_id else {
            return;
        };
        if let Err(e) = self.adapter.disconnect(&provider_id).await {
            warn!("session reaper: disconnect of expired session {} failed: {}", provider_id, e);
        }
        self.clear_provider_id().await;
        info!("session reaper: cleared expired session for provider id {}", provider_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceInfo;
    use crate::provider::docker::new_docker_adapter;

    #[tokio::test]
    async fn session_expires_after_ttl_elapses_without_health_check() {
        tokio::time::pause();
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(new_docker_adapter(
            "p1",
            "docker",
            "unix:///var/run/docker.sock",
            ResourceInfo::new(1000, 1024, 0),
        ));
        adapter.connect("caller-x").await.unwrap();
        let manager = Arc::new(SessionManager::new(adapter.clone(), 90));
        manager.set_provider_id("caller-x").await;
        assert!(manager.is_live().await);

        tokio::time::advance(Duration::from_secs(91)).await;
        manager.reap_if_expired().await;

        assert!(!manager.is_live().await);
        assert!(manager.get_provider_id().await.is_none());
    }

    #[tokio::test]
    async fn update_health_keeps_session_alive_past_naive_ttl() {
        tokio::time::pause();
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(new_docker_adapter(
            "p1",
            "docker",
            "unix:///var/run/docker.sock",
            ResourceInfo::new(1000, 1024, 0),
        ));
        adapter.connect("caller-x").await.unwrap();
        let manager = SessionManager::new(adapter, 90);
        manager.set_provider_id("caller-x").await;

        tokio::time::advance(Duration::from_secs(60)).await;
        manager.update_health().await;
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(manager.is_live().await);
    }

    /// Spec scenario 6: session expiry. A caller that lets the TTL lapse loses authorization
    /// for further calls, but a HealthCheck against the still-connected adapter succeeds and
    /// re-establishes the session without a fresh Connect.
    #[tokio::test]
    async fn health_check_after_expiry_reestablishes_session_for_subsequent_authorize() {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(new_docker_adapter(
            "p1",
            "docker",
            "unix:///var/run/docker.sock",
            ResourceInfo::new(1000, 1024, 0),
        ));
        adapter.connect("caller-x").await.unwrap();
        let manager = SessionManager::new(adapter, 90);
        manager.set_provider_id("caller-x").await;
        assert_eq!(manager.authorize().await.unwrap(), "caller-x");

        // Let the TTL lapse without a health check; the reaper has not run yet, so the
        // adapter is still connected, but the session manager must refuse authorization.
        {
            let mut session = manager.session.write().await;
            session.as_mut().unwrap().last_health_at = Utc::now() - ChronoDuration::seconds(91);
        }
        assert!(matches!(manager.authorize().await, Err(OrchestratorError::Auth(_))));

        // HealthCheck still reaches the adapter (no Connect needed) and resets the clock.
        manager.health_check().await.unwrap();
        assert_eq!(manager.authorize().await.unwrap(), "caller-x");
    }
}

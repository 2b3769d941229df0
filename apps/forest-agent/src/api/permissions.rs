//! Permission and scope enforcement.
//!
//! Both services wrap a cache from `forest-core` behind a tokio `RwLock` and
//! refill it from the authorization service. Freshness is always read from
//! the injected clock.

use crate::api::error::{ApiError, api_forbidden};
use crate::client::{ClientError, ForestClient};
use forest_core::scope::{Freshness, RenderingScopes};
use forest_core::{
    Clock, Filter, Permission, PermissionCache, PermissionPayload, RenderingId, ScopeCache, User,
};
use std::sync::Arc;
use tokio::sync::RwLock;

// =============================================================================
// PERMISSIONS
// =============================================================================

/// Shared permission cache plus the way to refill it.
#[derive(Clone)]
pub struct PermissionService {
    cache: Arc<RwLock<PermissionCache>>,
    client: ForestClient,
    clock: Arc<dyn Clock>,
}

impl PermissionService {
    pub fn new(client: ForestClient, clock: Arc<dyn Clock>, ttl_secs: i64) -> Self {
        Self {
            cache: Arc::new(RwLock::new(PermissionCache::with_ttl_secs(ttl_secs))),
            client,
            clock,
        }
    }

    /// Whether `user` may do what `permission` describes.
    ///
    /// A missing or expired entry is fetched first. A denial answered from
    /// an entry that was not fetched by this call triggers one more fetch,
    /// so grants made since the last fetch are honoured. Any fetch failure
    /// denies.
    pub async fn authorize(&self, user: &User, permission: &Permission) -> bool {
        let rendering = &user.rendering_id;
        let stale = self
            .cache
            .read()
            .await
            .needs_refresh(permission, rendering, self.clock.now());

        if stale && !self.try_refresh(rendering, permission).await {
            return false;
        }
        if self.cache.read().await.is_allowed(permission, user) {
            return true;
        }
        if stale {
            tracing::info!(
                user_id = %user.id,
                rendering_id = %rendering,
                permission = %permission.describe(),
                "permission denied"
            );
            return false;
        }

        tracing::debug!(
            rendering_id = %rendering,
            permission = %permission.describe(),
            "denied from cache, fetching again"
        );
        if !self.try_refresh(rendering, permission).await {
            return false;
        }
        let allowed = self.cache.read().await.is_allowed(permission, user);
        if !allowed {
            tracing::info!(
                user_id = %user.id,
                rendering_id = %rendering,
                permission = %permission.describe(),
                "permission denied"
            );
        }
        allowed
    }

    async fn try_refresh(&self, rendering: &RenderingId, permission: &Permission) -> bool {
        match self.refresh(rendering).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    rendering_id = %rendering,
                    permission = %permission.describe(),
                    error = %err,
                    "cannot fetch permissions, denying"
                );
                false
            }
        }
    }

    /// Fetch and cache the permission document of `rendering`.
    pub async fn refresh(&self, rendering: &RenderingId) -> Result<(), ClientError> {
        let payload = self.client.permissions(rendering).await?;
        self.preload(&payload, rendering).await
    }

    /// Cache an already known document as if it had just been fetched.
    pub async fn preload(
        &self,
        payload: &PermissionPayload,
        rendering: &RenderingId,
    ) -> Result<(), ClientError> {
        let now = self.clock.now();
        self.cache.write().await.store(payload, rendering, now)?;
        Ok(())
    }

    /// Drop every cached permission.
    pub async fn reset(&self) {
        self.cache.write().await.clear();
        tracing::info!("permission cache cleared");
    }
}

// =============================================================================
// SCOPES
// =============================================================================

/// Shared scope cache plus the way to refill it.
#[derive(Clone)]
pub struct ScopeService {
    cache: Arc<RwLock<ScopeCache>>,
    client: ForestClient,
    clock: Arc<dyn Clock>,
}

impl ScopeService {
    pub fn new(client: ForestClient, clock: Arc<dyn Clock>, ttl_secs: i64) -> Self {
        Self {
            cache: Arc::new(RwLock::new(ScopeCache::with_ttl_secs(ttl_secs))),
            client,
            clock,
        }
    }

    /// Scope filter of `collection` for `user`, `None` when unrestricted.
    ///
    /// Scopes never fetched are loaded before answering and a failure is a
    /// denial. Expired scopes are re-fetched; when that fails the previous
    /// scopes keep being served.
    pub async fn scope_for(&self, user: &User, collection: &str) -> Result<Option<Filter>, ApiError> {
        let rendering = &user.rendering_id;
        let freshness = self.cache.read().await.freshness(rendering, self.clock.now());

        match freshness {
            Freshness::Fresh => {}
            Freshness::Missing => {
                let scopes = self.client.scopes(rendering).await.map_err(|err| {
                    tracing::warn!(rendering_id = %rendering, error = %err, "cannot fetch scopes");
                    api_forbidden("Forbidden")
                })?;
                self.preload(rendering.clone(), scopes).await;
            }
            Freshness::Stale => match self.client.scopes(rendering).await {
                Ok(scopes) => self.preload(rendering.clone(), scopes).await,
                Err(err) => tracing::warn!(
                    rendering_id = %rendering,
                    error = %err,
                    "cannot refresh scopes, serving expired ones"
                ),
            },
        }

        Ok(self.cache.read().await.scope_for(user, collection)?)
    }

    /// Cache scopes as if they had just been fetched.
    pub async fn preload(&self, rendering: RenderingId, scopes: RenderingScopes) {
        let now = self.clock.now();
        self.cache.write().await.store(rendering, scopes, now);
    }

    /// Drop every cached scope.
    pub async fn reset(&self) {
        self.cache.write().await.clear();
    }
}

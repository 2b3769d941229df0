//! Agent configuration.
//!
//! Every setting has a `FOREST_*` environment fallback so the agent can be
//! configured the same way whether it runs standalone or embedded.

use clap::Args;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_SERVER_URL: &str = "https://api.forestadmin.com";
pub const DEFAULT_PERMISSIONS_TTL_SECS: i64 = 3600;
pub const DEFAULT_SCOPES_TTL_SECS: i64 = 300;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Settings shared by the router, the caches and the remote client.
#[derive(Clone, Args)]
pub struct AgentConfig {
    /// Secret identifying this environment to the authorization service.
    #[arg(long, env = "FOREST_ENV_SECRET")]
    pub env_secret: String,

    /// Secret used to verify admin session tokens (HS256).
    #[arg(long, env = "FOREST_AUTH_SECRET")]
    pub auth_secret: String,

    /// Base URL of the authorization service.
    #[arg(long, env = "FOREST_SERVER_URL", default_value = DEFAULT_SERVER_URL)]
    pub server_url: String,

    /// Lifetime of cached permissions.
    #[arg(
        long,
        env = "FOREST_PERMISSIONS_EXPIRATION_IN_SECONDS",
        default_value_t = DEFAULT_PERMISSIONS_TTL_SECS
    )]
    pub permissions_ttl_secs: i64,

    /// Lifetime of cached scopes.
    #[arg(
        long,
        env = "FOREST_SCOPE_EXPIRATION_IN_SECONDS",
        default_value_t = DEFAULT_SCOPES_TTL_SECS
    )]
    pub scopes_ttl_secs: i64,

    /// Timeout of calls to the authorization service.
    #[arg(
        long,
        env = "FOREST_REQUEST_TIMEOUT_IN_SECONDS",
        default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS
    )]
    pub request_timeout_secs: u64,
}

impl AgentConfig {
    /// Configuration with default server, TTLs and timeout.
    pub fn new(env_secret: impl Into<String>, auth_secret: impl Into<String>) -> Self {
        Self {
            env_secret: env_secret.into(),
            auth_secret: auth_secret.into(),
            server_url: DEFAULT_SERVER_URL.to_string(),
            permissions_ttl_secs: DEFAULT_PERMISSIONS_TTL_SECS,
            scopes_ttl_secs: DEFAULT_SCOPES_TTL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }

    #[must_use]
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    #[must_use]
    pub fn with_permissions_ttl_secs(mut self, secs: i64) -> Self {
        self.permissions_ttl_secs = secs;
        self
    }

    #[must_use]
    pub fn with_scopes_ttl_secs(mut self, secs: i64) -> Self {
        self.scopes_ttl_secs = secs;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Server URL without a trailing slash.
    pub fn server_base(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }
}

// Secrets never reach logs.
impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("env_secret", &"<redacted>")
            .field("auth_secret", &"<redacted>")
            .field("server_url", &self.server_url)
            .field("permissions_ttl_secs", &self.permissions_ttl_secs)
            .field("scopes_ttl_secs", &self.scopes_ttl_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

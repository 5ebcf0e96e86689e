//! Startup orchestration.
//!
//! Subsystems initialize in dependency order: moderation policy, rate
//! limiter, pipeline, then background tasks, and listeners last so traffic
//! only arrives once everything is ready. Any startup error is fatal.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::RecommendedWatcher;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::admin::{setup_admin_router, AdminState};
use crate::config::schema::GatewayConfig;
use crate::config::watcher::PolicyWatcher;
use crate::http::server::GatewayServer;
use crate::lifecycle::shutdown::Shutdown;
use crate::pipeline::Pipeline;
use crate::security::moderation::{CompiledPolicy, ContentModerator, ModerationPolicy, PolicyError};
use crate::security::rate_limit::{spawn_sweeper, RateLimiter};
use crate::upstream::CompletionProvider;

/// Error that prevents the gateway from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("moderation policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("sanitizer pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("policy watcher: {0}")]
    Watch(#[from] notify::Error),
}

/// Initialized, not yet serving.
pub struct Gateway {
    pub config: Arc<GatewayConfig>,
    pub limiter: Arc<RateLimiter>,
    pub moderator: Arc<ContentModerator>,
    pub pipeline: Arc<Pipeline>,
    started: Instant,
}

impl Gateway {
    pub fn build(config: GatewayConfig) -> Result<Self, StartupError> {
        let policy = match &config.moderation.policy_path {
            Some(path) => ModerationPolicy::load(Path::new(path))?,
            None => ModerationPolicy::builtin()?,
        };
        let moderator = Arc::new(
            ContentModerator::new(CompiledPolicy::compile(&policy)?)
                .enabled(config.moderation.enabled),
        );
        tracing::info!(
            version = %policy.version,
            categories = policy.categories.len(),
            enabled = config.moderation.enabled,
            "Moderation policy loaded"
        );

        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        let pipeline = Arc::new(Pipeline::from_config(&config, limiter.clone(), moderator.clone())?);

        Ok(Self {
            config: Arc::new(config),
            limiter,
            moderator,
            pipeline,
            started: Instant::now(),
        })
    }

    pub fn server(&self, provider: Arc<dyn CompletionProvider>) -> GatewayServer {
        GatewayServer::new(self.config.clone(), self.pipeline.clone(), provider)
    }

    pub fn admin_state(&self) -> AdminState {
        AdminState {
            api_key: Arc::from(self.config.admin.api_key.as_str()),
            limiter: self.limiter.clone(),
            moderator: self.moderator.clone(),
            started: self.started,
        }
    }

    /// Watch the policy file when configured. Keep the watcher alive.
    pub fn watch_policy(&self) -> Result<Option<RecommendedWatcher>, StartupError> {
        match &self.config.moderation.policy_path {
            Some(path) if self.config.moderation.watch => {
                let watcher = PolicyWatcher::new(Path::new(path), self.moderator.clone()).run()?;
                Ok(Some(watcher))
            }
            _ => Ok(None),
        }
    }

    pub fn spawn_sweeper(&self, shutdown: &Shutdown) -> Option<JoinHandle<()>> {
        if !self.limiter.is_enabled() {
            return None;
        }
        let interval = Duration::from_secs(self.config.rate_limit.sweep_interval_secs);
        Some(spawn_sweeper(self.limiter.clone(), interval, shutdown.subscribe()))
    }

    /// Serve the admin API on its own listener until shutdown.
    pub async fn spawn_admin(&self, shutdown: &Shutdown) -> Result<Option<JoinHandle<()>>, StartupError> {
        if !self.config.admin.enabled {
            return Ok(None);
        }

        let listener = TcpListener::bind(&self.config.admin.bind_address).await?;
        let addr = listener.local_addr()?;
        let router = setup_admin_router(self.admin_state());
        let mut rx = shutdown.subscribe();

        tracing::info!(address = %addr, "Admin API listening");
        Ok(Some(tokio::spawn(async move {
            let serve = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    let _ = rx.recv().await;
                });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "Admin API failed");
            }
        })))
    }
}

/// Start every subsystem and serve the chat endpoint until `shutdown` fires.
pub async fn run(
    config: GatewayConfig,
    provider: Arc<dyn CompletionProvider>,
    shutdown: Shutdown,
) -> Result<(), StartupError> {
    let gateway = Gateway::build(config)?;

    let _watcher = gateway.watch_policy()?;
    let sweeper = gateway.spawn_sweeper(&shutdown);
    let admin = gateway.spawn_admin(&shutdown).await?;

    let listener = TcpListener::bind(&gateway.config.listener.bind_address).await?;
    gateway.server(provider).run(listener, shutdown.subscribe()).await?;

    for task in [sweeper, admin].into_iter().flatten() {
        let _ = task.await;
    }
    Ok(())
}

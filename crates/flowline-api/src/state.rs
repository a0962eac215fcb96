//! Application state wiring the engine to its SQLite repositories.
//!
//! `FlowEngine` is generic over its repositories; AppState pins it to the
//! concrete infra implementations. The scheduler transport depends on the
//! caller: CLI commands queue continuations on an [`InlineScheduler`] and
//! drain it themselves, `serve` feeds a [`ChannelScheduler`] consumed by the
//! background worker.

use std::path::PathBuf;
use std::sync::Arc;

use flowline_core::event::EventBus;
use flowline_core::flow::handler::AiStepHandler;
use flowline_core::flow::scheduler::Continuation;
use flowline_core::flow::{
    ChannelScheduler, ContinuationScheduler, EngineSettings, FlowEngine, InlineScheduler,
};
use flowline_infra::ai_handler::build_ai_handler;
use flowline_infra::config::{load_engine_config, resolve_data_dir};
use flowline_infra::sqlite::entity::SqliteEntityRepository;
use flowline_infra::sqlite::flow::SqliteFlowRepository;
use flowline_infra::sqlite::pool::{DatabasePool, database_url};
use flowline_types::config::EngineConfig;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::http::extractors::auth::{INTERNAL_TOKEN_ENV, hash_token};

pub type ConcreteEngine = FlowEngine<SqliteFlowRepository, SqliteEntityRepository>;

/// Shared application state.
///
/// Used by both CLI commands and the internal HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub config: Arc<EngineConfig>,
    pub data_dir: PathBuf,
    /// SHA-256 (lowercase hex) of the configured internal token.
    pub internal_token_hash: Option<Arc<str>>,
    /// Set when continuations are queued in-process (CLI mode).
    pub inline: Option<Arc<InlineScheduler>>,
}

/// Everything the store layer needs, opened once per process.
struct Resources {
    config: EngineConfig,
    data_dir: PathBuf,
    db_pool: DatabasePool,
    ai_handler: Arc<dyn AiStepHandler>,
}

impl Resources {
    async fn open() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;
        let ai_handler = build_ai_handler(&config.ai_handler)?;

        Ok(Self {
            config,
            data_dir,
            db_pool,
            ai_handler,
        })
    }
}

impl AppState {
    /// State for one-shot CLI commands.
    pub async fn init_inline() -> anyhow::Result<Self> {
        let resources = Resources::open().await?;
        let inline = Arc::new(InlineScheduler::new());
        let mut state = Self::assemble(resources, inline.clone());
        state.inline = Some(inline);
        Ok(state)
    }

    /// State for `serve`. The returned scheduler and receiver belong to the
    /// continuation worker.
    pub async fn init_channel()
    -> anyhow::Result<(Self, ChannelScheduler, UnboundedReceiver<Continuation>)> {
        let resources = Resources::open().await?;
        let (scheduler, receiver) = ChannelScheduler::new();
        let state = Self::assemble(resources, Arc::new(scheduler.clone()));
        Ok((state, scheduler, receiver))
    }

    #[cfg(test)]
    pub fn from_parts(
        config: EngineConfig,
        data_dir: PathBuf,
        db_pool: DatabasePool,
        ai_handler: Arc<dyn AiStepHandler>,
        scheduler: Arc<dyn ContinuationScheduler>,
    ) -> Self {
        Self::assemble(
            Resources {
                config,
                data_dir,
                db_pool,
                ai_handler,
            },
            scheduler,
        )
    }

    fn assemble(resources: Resources, scheduler: Arc<dyn ContinuationScheduler>) -> Self {
        let Resources {
            config,
            data_dir,
            db_pool,
            ai_handler,
        } = resources;

        let engine = FlowEngine::new(
            Arc::new(SqliteFlowRepository::new(db_pool.clone())),
            Arc::new(SqliteEntityRepository::new(db_pool.clone())),
            ai_handler,
            scheduler,
            EventBus::default(),
            EngineSettings::from(&config),
        );

        let internal_token_hash = std::env::var(INTERNAL_TOKEN_ENV)
            .ok()
            .filter(|t| !t.is_empty())
            .map(|t| Arc::from(hash_token(&t)));

        Self {
            engine: Arc::new(engine),
            config: Arc::new(config),
            data_dir,
            internal_token_hash,
            inline: None,
        }
    }

    /// Replace the token read from the environment.
    #[cfg(test)]
    pub fn with_internal_token(mut self, token: Option<&str>) -> Self {
        self.internal_token_hash = token.map(|t| Arc::from(hash_token(t)));
        self
    }

    /// Drain the inline queue, if this state has one.
    pub async fn drain_inline(&self) -> Vec<flowline_core::flow::AdvanceOutcome> {
        match &self.inline {
            Some(inline) => inline.drain(self.engine.as_ref()).await,
            None => Vec::new(),
        }
    }

    /// Continuations still queued in-process.
    pub fn pending_inline(&self) -> usize {
        self.inline.as_ref().map(|i| i.pending()).unwrap_or(0)
    }
}

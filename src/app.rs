//! Component wiring.
//!
//! Builds the SQLite-backed stores, the embedding provider, and the
//! collaborators from a [`Config`], and assembles them into the
//! [`Orchestrator`] and the [`IngestionPipeline`]. The CLI and the HTTP
//! server both start from [`App::open`].

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;

use ticket_flow_core::conversation::store::ConversationStore;
use ticket_flow_core::detect::DuplicateDetector;
use ticket_flow_core::index::SimilarityIndex;

use crate::checkpoints::Checkpoints;
use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::ingest::{IngestionPipeline, ScopeLocks};
use crate::jira::create_tracker;
use crate::migrate::migrate_pool;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::sqlite_conversations::SqliteConversations;
use crate::sqlite_index::SqliteIndex;
use crate::suggestions::create_suggestions;

pub struct App {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub index: Arc<dyn SimilarityIndex>,
    pub orchestrator: Arc<Orchestrator>,
    pub pipeline: Arc<IngestionPipeline>,
}

impl App {
    /// Connect to the database (creating tables if needed) and build
    /// every component.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate_pool(&pool).await?;

        let embedder = create_provider(&config.embedding)?;
        let tracker = create_tracker(&config.tracker)?;
        let suggestions = create_suggestions(&config.suggestions)?;

        let index: Arc<dyn SimilarityIndex> = Arc::new(SqliteIndex::new(pool.clone()));
        let detector = Arc::new(DuplicateDetector::new(
            embedder.clone(),
            index.clone(),
            config.detection.params(),
        ));
        let store = ConversationStore::new(
            Arc::new(SqliteConversations::new(pool.clone())),
            config.conversation.store_settings(),
        );

        let orchestrator = Orchestrator::new(
            store,
            detector,
            tracker.clone(),
            suggestions,
            OrchestratorSettings::from_config(config),
        );
        let pipeline = IngestionPipeline::new(
            tracker,
            embedder,
            index.clone(),
            Checkpoints::new(pool.clone()),
            ScopeLocks::new(),
            config.ingestion.clone(),
        );

        Ok(Self {
            config: Arc::new(config.clone()),
            pool,
            index,
            orchestrator: Arc::new(orchestrator),
            pipeline: Arc::new(pipeline),
        })
    }

    /// Projects named on the command line, or all configured ones.
    pub fn projects(&self, only: Option<String>) -> Vec<String> {
        match only {
            Some(project) => vec![project],
            None => self.config.ingestion.projects.clone(),
        }
    }
}

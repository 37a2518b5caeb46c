//! Top-level component wiring.
//!
//! All shared components — governor, clients, store, state — are owned by
//! one [`Service`] value constructed in `main` and handed to the run
//! modes. Nothing in the crate reaches for a global.

use std::sync::Arc;

use tokio::sync::watch;

use crate::auth::ApiKeys;
use crate::chat::ChatClient;
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::enhancer::QueryEnhancer;
use crate::error::Result;
use crate::governor::RateGovernor;
use crate::ingest::IngestionWorker;
use crate::oplog::OpLog;
use crate::search::SearchService;
use crate::server::AppState;
use crate::session::SessionManager;
use crate::state::StateStore;
use crate::store::VectorStore;

pub struct Service {
    pub config: Arc<Config>,
    pub chat: Arc<ChatClient>,
    pub embedder: Arc<EmbeddingClient>,
    pub enhancer: Arc<QueryEnhancer>,
    pub store: Arc<dyn VectorStore>,
    pub state: Arc<StateStore>,
    pub oplog: Arc<OpLog>,
    pub search: Arc<SearchService>,
}

impl Service {
    /// Build every component from configuration.
    pub async fn init(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let governor = Arc::new(RateGovernor::new(&config));
        let chat = Arc::new(ChatClient::new(&config, Arc::clone(&governor))?);
        let embedder = Arc::new(EmbeddingClient::new(&config, Arc::clone(&governor))?);
        let enhancer = Arc::new(QueryEnhancer::new(&config, Arc::clone(&governor))?);
        let store = crate::store::open(&config).await?;
        let state = Arc::new(StateStore::load(&config.state_path)?);
        let oplog = Arc::new(OpLog::new(&config));

        let search = Arc::new(SearchService::new(
            Arc::clone(&config),
            Arc::clone(&chat),
            Arc::clone(&embedder),
            Arc::clone(&enhancer),
            Arc::clone(&store),
            Arc::clone(&state),
        ));

        Ok(Self {
            config,
            chat,
            embedder,
            enhancer,
            store,
            state,
            oplog,
            search,
        })
    }

    pub fn ingestion_worker(&self, shutdown: watch::Receiver<bool>) -> Arc<IngestionWorker> {
        IngestionWorker::new(
            Arc::clone(&self.config),
            Arc::clone(&self.chat),
            Arc::clone(&self.embedder),
            Arc::clone(&self.store),
            Arc::clone(&self.state),
            Arc::clone(&self.oplog),
            shutdown,
        )
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            config: Arc::clone(&self.config),
            auth: Arc::new(ApiKeys::new(&self.config)),
            sessions: Arc::new(SessionManager::new()),
            search: Arc::clone(&self.search),
        }
    }
}

// src/runtime.rs
// Explicit process-wide runtime: state-store client, Markov reader, scoring
// pipeline, HTTP client, metrics, config, secrets. Built once at startup
// and handed to every component; there are no ambient singletons beyond the
// connection multiplexers inside the clients themselves.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::escalation::Pipeline;
use crate::markov::MarkovStore;
use crate::metrics::Metrics;
use crate::secrets::Secrets;
use crate::state::StateStore;

pub struct Runtime {
    pub config: Config,
    pub secrets: Secrets,
    pub state: StateStore,
    pub markov: Option<Arc<MarkovStore>>,
    pub pipeline: Pipeline,
    pub http: reqwest::Client,
    pub metrics: Metrics,
}

impl Runtime {
    /// Full startup: load secrets, connect the state store, open the Markov
    /// model and classifier artifact when configured. Any failure here is
    /// fatal and maps to a non-zero exit code.
    pub async fn bootstrap(config: Config) -> Result<Arc<Self>> {
        let secrets = Secrets::load(&config);
        let state = StateStore::connect(&config, &secrets).await?;
        Self::assemble(config, secrets, state)
    }

    /// Assembly over an existing state store. Tests and dry runs use this
    /// with the in-memory backend.
    pub fn assemble(config: Config, secrets: Secrets, state: StateStore) -> Result<Arc<Self>> {
        let markov = match &config.markov_db_path {
            Some(path) => {
                let store = MarkovStore::open(path)?;
                info!(path = %path.display(), "opened markov store");
                Some(Arc::new(store))
            }
            None => {
                warn!("no markov store configured; tarpit text falls back to the built-in corpus");
                None
            }
        };

        let pipeline = Pipeline::build(&config)?;

        Ok(Arc::new(Runtime {
            config,
            secrets,
            state,
            markov,
            pipeline,
            http: reqwest::Client::new(),
            metrics: Metrics::default(),
        }))
    }
}

use std::sync::Arc;

use jobrelay_engine::Engine;
use jobrelay_engine::classifier::{
    HttpRetryPredictor, InMemoryVerdictCache, RetryClassifier, RetryPredictor,
    UnconfiguredPredictor,
};
use jobrelay_engine::definitions::{DefinitionCache, DefinitionSource, StaticDefinitionSource};
use jobrelay_engine::mutex::{DistributedMutex, LocalMutex, PgAdvisoryMutex};
use jobrelay_engine::store::{InMemoryJobStore, JobStore, PostgresJobStore};
use jobrelay_engine::sweeper::{DEFAULT_SWEEP_INTERVAL, Sweeper};
use jobrelay_events::{EngineEvent, EventSink, InMemoryEventBus};

#[tokio::main]
async fn main() {
    jobrelay_observability::init();

    let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
        tracing::warn!("JWT_SECRET not set; using insecure dev default");
        "dev-secret".to_string()
    });

    let (store, mutex): (Arc<dyn JobStore>, Arc<dyn DistributedMutex>) =
        match std::env::var("JOBRELAY_DATABASE_URL") {
            Ok(url) => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(10)
                    .connect(&url)
                    .await
                    .expect("failed to connect to database");
                let store = PostgresJobStore::new(pool);
                store.migrate().await.expect("failed to apply schema");
                let mutex = PgAdvisoryMutex::new(store.pool().clone());
                (Arc::new(store), Arc::new(mutex))
            }
            Err(_) => {
                tracing::warn!("JOBRELAY_DATABASE_URL not set; using in-memory store");
                (InMemoryJobStore::arc(), Arc::new(LocalMutex::new()))
            }
        };

    let predictor: Arc<dyn RetryPredictor> = match std::env::var("JOBRELAY_PREDICTOR_URL") {
        Ok(url) => Arc::new(HttpRetryPredictor::new(url)),
        Err(_) => Arc::new(UnconfiguredPredictor),
    };

    let definitions: Arc<dyn DefinitionSource> = match std::env::var("JOBRELAY_DEFINITIONS") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path).expect("failed to read definitions file");
            Arc::new(
                serde_json::from_str::<definitions_file::DefinitionsFile>(&raw)
                    .expect("failed to parse definitions file")
                    .into_source(),
            )
        }
        Err(_) => Arc::new(StaticDefinitionSource::new()),
    };

    let sink = EventSink::new(Arc::new(InMemoryEventBus::<EngineEvent>::new()));

    let engine = Engine::new(
        store.clone(),
        DefinitionCache::new(definitions),
        RetryClassifier::new(Arc::new(InMemoryVerdictCache::new()), predictor),
        sink.clone(),
    );

    let sweeper = Sweeper::new(store, mutex, sink, DEFAULT_SWEEP_INTERVAL).spawn();

    let app = jobrelay_api::app::build_app(engine, jwt_secret);

    let bind = std::env::var("JOBRELAY_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {bind}: {e}"));

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();

    sweeper.shutdown().await;
}

mod definitions_file {
    //! On-disk definitions format: owners mapped to cluster settings and
    //! per-service documents.

    use std::collections::HashMap;

    use serde::Deserialize;

    use jobrelay_core::{ClusterSettings, ServiceDefinition};
    use jobrelay_engine::definitions::StaticDefinitionSource;

    #[derive(Debug, Deserialize)]
    pub struct OwnerEntry {
        #[serde(default)]
        pub cluster: ClusterSettings,
        #[serde(default)]
        pub services: HashMap<String, ServiceDefinition>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(transparent)]
    pub struct DefinitionsFile {
        pub owners: HashMap<String, OwnerEntry>,
    }

    impl DefinitionsFile {
        pub fn into_source(self) -> StaticDefinitionSource {
            let mut source = StaticDefinitionSource::new();
            for (owner, entry) in self.owners {
                source = source.with_cluster(owner.clone(), entry.cluster);
                for (service, definition) in entry.services {
                    source = source.with_service(owner.clone(), service, definition);
                }
            }
            source
        }
    }
}

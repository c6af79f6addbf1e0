//! Core application

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::core::cli::{self, CliConfig};
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::core::trace_config::{StaticTraceConfig, TraceConfig};
use crate::data::broker::{BrokerFactory, create_factory};
use crate::data::{MemoryObjectStore, TraceStore};
use crate::domain::annotation::{AnnotationEventConsumer, AnnotationProducer, AnnotationService};
use crate::domain::consumer::ConsumerRegistry;
use crate::domain::ingest::{IngestService, SpanConsumer};
use crate::domain::processor::ProcessorBuilder;
use crate::domain::query::QueryService;

/// Log filter when neither the CLI nor the environment sets one
const DEFAULT_LOG_FILTER: &str = "info,looptrace_server=info";

pub struct CoreApp {
    pub shutdown: ShutdownService,
    pub config: AppConfig,
    pub trace_config: Arc<dyn TraceConfig>,
    pub store: TraceStore,
    pub factory: Arc<dyn BrokerFactory>,
    pub registry: Arc<ConsumerRegistry>,
    pub ingest: Arc<IngestService>,
    pub query: Arc<QueryService>,
    pub annotations: Arc<AnnotationService>,
    pub annotation_producer: Arc<AnnotationProducer>,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        let cli_config = cli::parse();
        Self::init_logging(cli_config.log.as_deref());

        tracing::debug!("Application starting");

        let app = Self::init(&cli_config).await?;
        app.serve().await
    }

    async fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;
        let trace_config: Arc<dyn TraceConfig> =
            Arc::new(StaticTraceConfig::new(config.trace.clone()));

        let tables = trace_config.tenant_tables().ok();
        let store = TraceStore::init(config.store.backend, &config.store.clickhouse, tables)
            .await
            .context("Failed to initialize trace store")?;
        tracing::debug!(backend = %store.backend(), "Trace store initialized");

        let factory = create_factory(&config.broker.settings())
            .await
            .context("Failed to initialize broker")?;
        tracing::debug!(driver = factory.driver_name(), "Broker initialized");

        let repository = store.repository();
        let processors = ProcessorBuilder::new(
            Arc::clone(&trace_config),
            Arc::new(MemoryObjectStore::new()),
        );
        let ingest = Arc::new(IngestService::new(
            Arc::clone(&trace_config),
            Arc::clone(&factory),
            processors.clone(),
        ));
        let query = Arc::new(QueryService::new(
            Arc::clone(&trace_config),
            Arc::clone(&repository),
            processors.clone(),
        ));
        let annotation_producer = Arc::new(AnnotationProducer::new(
            Arc::clone(&trace_config),
            Arc::clone(&factory),
        ));
        let annotations = Arc::new(AnnotationService::new(
            Arc::clone(&trace_config),
            Arc::clone(&repository),
            Arc::clone(&annotation_producer),
        ));

        let registry = Arc::new(ConsumerRegistry::new(Arc::clone(&factory)));
        for tenant in trace_config.tenant_configs() {
            registry
                .register(Arc::new(SpanConsumer::new(
                    &tenant.tenant,
                    Arc::clone(&trace_config),
                    Arc::clone(&repository),
                    processors.clone(),
                )))
                .await;
        }
        match trace_config.annotation_consumer_config() {
            Ok(_) => {
                registry
                    .register(Arc::new(AnnotationEventConsumer::new(
                        Arc::clone(&trace_config),
                        Arc::clone(&repository),
                        Arc::clone(&annotation_producer),
                    )))
                    .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Annotation consumer disabled");
            }
        }

        let shutdown = ShutdownService::new(Some(Arc::clone(&registry)));

        Ok(Self {
            shutdown,
            config,
            trace_config,
            store,
            factory,
            registry,
            ingest,
            query,
            annotations,
            annotation_producer,
        })
    }

    fn init_logging(cli_filter: Option<&str>) {
        let filter = cli_filter
            .map(str::to_string)
            .or_else(|| std::env::var(ENV_LOG).ok())
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn serve(self) -> Result<()> {
        // Install signal handlers FIRST (before any blocking calls)
        self.shutdown.install_signal_handlers();

        self.registry
            .start_all()
            .await
            .context("Failed to start consumers")?;
        let consumers = self.registry.running_count().await;
        tracing::info!(
            consumers,
            store = %self.store.backend(),
            broker = self.factory.driver_name(),
            "{APP_NAME} running"
        );

        self.shutdown.wait().await;
        self.shutdown.shutdown().await;

        self.ingest.close().await;
        self.annotation_producer.close().await;
        tracing::info!("Stopped");
        Ok(())
    }
}

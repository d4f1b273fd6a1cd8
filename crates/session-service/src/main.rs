//! Session Service
//!
//! REST API for rental sessions + background base image warm-up

use anyhow::{Context, Result};
use code_vault::CodeVault;
use execution_engine::{BaseImageManager, ContainerRuntime, DockerRuntime, ImageCatalog, Orchestrator};
use security_gate::{HttpRiskAssessor, RiskAssessor, SecurityGate};
use session_service::{
    create_router, AppState, Config, MemorySessionStore, RedisSessionStore, SessionService,
    SessionStore, StorageBackend,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "session_service=debug,execution_engine=debug,security_gate=info,code_vault=info,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    info!("Starting Session Service");
    info!("Storage backend: {:?}", config.storage_backend);
    info!("Work directory: {}", config.work_dir.display());
    info!("Base runtime image: {}", config.base_runtime_image);

    config.ensure_directories()?;

    let store: Arc<dyn SessionStore> = match config.storage_backend {
        StorageBackend::Redis => Arc::new(
            RedisSessionStore::new(&config.redis_url)
                .await
                .context("Failed to initialize session storage")?,
        ),
        StorageBackend::Memory => {
            warn!("Using in-memory session storage; sessions are lost on restart");
            Arc::new(MemorySessionStore::new())
        }
    };

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect()
            .await
            .context("Failed to connect to the container runtime")?,
    );

    let catalog = Arc::new(ImageCatalog::standard());
    let base_images = Arc::new(BaseImageManager::new(
        Arc::clone(&catalog),
        Arc::clone(&runtime),
        config.base_runtime_image.clone(),
        config.work_dir.clone(),
    ));

    if config.warmup_on_start {
        let manager = Arc::clone(&base_images);
        tokio::spawn(async move {
            manager.warm_up().await;
        });
    }

    let assessor: Option<Arc<dyn RiskAssessor>> = match config.assessor_config() {
        Some(assessor_config) => {
            info!("Risk assessor: {}", assessor_config.url);
            Some(Arc::new(
                HttpRiskAssessor::new(assessor_config)
                    .context("Failed to create risk assessor client")?,
            ))
        }
        None => {
            warn!("No risk assessor API key configured; using static analysis only");
            None
        }
    };

    let vault = CodeVault::new(config.kdf_iterations);
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&runtime),
        catalog,
        vault.clone(),
        config.orchestrator_config(),
    ));

    let service = SessionService::new(
        store,
        SecurityGate::new(assessor),
        vault,
        orchestrator,
        base_images,
    );

    // Create router
    let app = create_router(AppState { service });

    // Start API server
    let addr = config.api_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("Session Service API running on http://{}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

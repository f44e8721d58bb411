use anyhow::{Context, Result};
use lifecycle_service::api::{start_api_server, AppState};
use lifecycle_service::config::{Config, ProviderKind};
use lifecycle_service::provider::{MemoryProvider, PostgresProvider, S3Provider, StorageProvider};
use lifecycle_service::{DataLifecycleManager, ProviderRegistry};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting lifecycle service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize providers and routing
    let registry = Arc::new(
        build_registry(&config)
            .await
            .context("Failed to initialize storage providers")?,
    );

    let manager = Arc::new(
        DataLifecycleManager::from_config(&config, registry)
            .context("Failed to initialize lifecycle manager")?,
    );

    if config.lifecycle.scheduler_enabled {
        manager.start_scheduler();
        info!(schedule = %config.lifecycle.schedule, "Lifecycle scheduler enabled");
    } else {
        warn!("Lifecycle scheduler disabled, cycles run only on demand");
    }

    // Spawn API server task
    let api_state = AppState {
        manager: manager.clone(),
    };
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Lifecycle service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down lifecycle service");

    manager.shutdown().await;
    api_handle.abort();

    info!("Lifecycle service stopped");

    Ok(())
}

/// Build every configured provider and the routing table
async fn build_registry(config: &Config) -> Result<ProviderRegistry> {
    let mut builder = ProviderRegistry::builder();

    for provider_config in &config.providers {
        let name = provider_config.name.clone();
        let provider: Arc<dyn StorageProvider> = match provider_config.kind {
            ProviderKind::Memory => Arc::new(MemoryProvider::new(&name)),
            ProviderKind::Postgres => {
                let database = config
                    .database
                    .as_ref()
                    .context("postgres provider without [database] section")?;
                let postgres = PostgresProvider::new(&name, database)
                    .await
                    .with_context(|| format!("Failed to connect provider {}", name))?;

                // Run migrations if enabled
                if database.run_migrations {
                    postgres
                        .run_migrations()
                        .await
                        .context("Failed to run database migrations")?;
                }
                Arc::new(postgres)
            }
            ProviderKind::S3 => {
                let s3 = config
                    .s3
                    .as_ref()
                    .context("s3 provider without [s3] section")?;
                Arc::new(
                    S3Provider::new(&name, s3)
                        .await
                        .with_context(|| format!("Failed to initialize provider {}", name))?,
                )
            }
        };

        info!(
            provider = %name,
            kind = ?provider_config.kind,
            tiers = ?provider_config.tiers,
            "Registered storage provider"
        );
        builder = builder.register(
            name,
            provider_config.technology(),
            provider_config.tiers.iter().copied(),
            provider,
        );
    }

    builder = builder.routes(config.routing.clone());
    if let Some(default_provider) = &config.default_provider {
        builder = builder.default_provider(default_provider);
    }
    if let Some(archive_provider) = &config.archive_provider {
        builder = builder.archive_provider(archive_provider);
    }

    Ok(builder.build()?)
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

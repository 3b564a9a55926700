//! drydock - a content-addressed OCI/Docker v2 container image registry

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

use config::{Config, parse_duration};
use drydock_api::{AppState, MetricsHandle, Services, create_router};
use drydock_auth::{
    AccessController, HtpasswdAccessController, SillyAccessController, TokenAccessController,
};
use drydock_core::{
    BlobDescriptorCache, Broadcaster, Endpoint, InMemoryDescriptorCache, ManifestPolicy, Namespace,
    PlatformPolicy, ProxyRegistry, ProxyScheduler, RedisDescriptorCache, Registry, RegistryConfig,
    UploadPurgeConfig, spawn_delivery_worker, spawn_ttl_scheduler, spawn_upload_purger,
};
use drydock_proxy::{RemoteClient, RemoteConfig};
use drydock_storage::{FilesystemDriver, InMemoryDriver, StorageDriver};

/// drydock - a content-addressed container image registry
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/drydock.toml")]
    config: String,

    /// Bind address
    #[arg(long, env = "DRYDOCK_BIND")]
    bind: Option<String>,

    /// Port
    #[arg(short, long, env = "DRYDOCK_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    init_logging(&config.log.level, &config.log.format);
    info!("starting drydock v{}", env!("CARGO_PKG_VERSION"));

    // Establish the shared HTTP secret up front so a generated one is warned
    // about exactly once at startup.
    let _http_secret = config.http.effective_secret();

    // Storage driver
    let driver: Arc<dyn StorageDriver> = match config.storage.driver.as_str() {
        "inmemory" => {
            info!("using in-memory storage driver");
            Arc::new(InMemoryDriver::new())
        }
        _ => {
            info!("using filesystem storage driver at {}", config.storage.rootdirectory);
            Arc::new(FilesystemDriver::new(&config.storage.rootdirectory).await?)
        }
    };

    // Descriptor cache
    let cache: Option<Arc<dyn BlobDescriptorCache>> =
        match config.storage.cache.blobdescriptor.as_deref() {
            Some("inmemory") => {
                info!(
                    "descriptor cache: in-memory ({} entries)",
                    config.storage.cache.blobdescriptorsize
                );
                Some(Arc::new(InMemoryDescriptorCache::new(
                    config.storage.cache.blobdescriptorsize,
                )))
            }
            Some("redis") => {
                let url = config.redis.url.as_deref().expect("validated at load");
                info!("descriptor cache: redis");
                Some(Arc::new(
                    RedisDescriptorCache::connect(url)
                        .await
                        .map_err(|e| anyhow::anyhow!("redis connect failed: {e}"))?,
                ))
            }
            _ => None,
        };

    // Manifest validation policy
    let indexes = &config.validation.manifests.indexes;
    let platform_policy = match indexes.platforms.as_str() {
        "all" => PlatformPolicy::All,
        "list" => PlatformPolicy::List,
        _ => PlatformPolicy::None,
    };
    let policy = ManifestPolicy::new(
        config.validation.enabled,
        &config.validation.manifests.urls.allow,
        &config.validation.manifests.urls.deny,
        platform_policy,
        indexes
            .platformlist
            .iter()
            .map(|p| drydock_core::Platform {
                architecture: p.architecture.clone(),
                os: p.os.clone(),
            })
            .collect(),
    )
    .context("invalid manifest URL policy regex")?;

    let registry = Registry::new(
        driver.clone(),
        cache,
        Arc::new(policy),
        RegistryConfig {
            delete_enabled: config.storage.delete.enabled,
            read_only: config.storage.maintenance.readonly.enabled,
            tag_concurrency_limit: config.storage.tag.concurrencylimit,
        },
    );

    // Pull-through mode wraps the local namespace when an upstream is set.
    let namespace: Arc<dyn Namespace> = match &config.proxy {
        Some(proxy) => {
            info!("pull-through cache mode, upstream: {}", proxy.remoteurl);
            let remote = Arc::new(RemoteClient::new(RemoteConfig {
                url: proxy.remoteurl.clone(),
                username: proxy.username.clone(),
                password: proxy.password.clone(),
                timeout: std::time::Duration::from_secs(60),
            })?);
            let ttl = parse_duration(&proxy.ttl)?;
            let ttl = (!ttl.is_zero()).then_some(ttl);
            let scheduler = Arc::new(ProxyScheduler::load(driver.clone()).await);
            if ttl.is_some() {
                spawn_ttl_scheduler(scheduler.clone(), std::time::Duration::from_secs(60));
            }
            Arc::new(ProxyRegistry::new(registry, remote, scheduler, ttl))
        }
        None => Arc::new(registry),
    };

    // Access controller
    let auth: Option<Arc<dyn AccessController>> = match config.auth.mode.as_str() {
        "silly" => {
            info!("access controller: silly");
            Some(Arc::new(SillyAccessController::new(
                config.auth.realm.clone(),
                config.auth.service.clone(),
            )))
        }
        "htpasswd" => {
            let path = config.auth.htpasswd_path.as_deref().expect("validated at load");
            info!("access controller: htpasswd ({})", path);
            Some(Arc::new(
                HtpasswdAccessController::from_file(config.auth.realm.clone(), path)
                    .map_err(|e| anyhow::anyhow!("failed to load credentials: {e}"))?,
            ))
        }
        "token" => {
            info!("access controller: token");
            let secret = config.auth.token_secret.as_deref().expect("validated at load");
            Some(Arc::new(TokenAccessController::new(
                config.auth.realm.clone(),
                config.auth.service.clone(),
                config.auth.issuer.clone(),
                secret.as_bytes(),
            )))
        }
        _ => None,
    };

    // Notification broadcaster
    let events = if config.notifications.endpoints.is_empty() {
        None
    } else {
        let endpoints = config
            .notifications
            .endpoints
            .iter()
            .map(|e| {
                Ok(Endpoint {
                    name: e.name.clone(),
                    url: e.url.clone(),
                    timeout: parse_duration(&e.timeout)?,
                    threshold: e.threshold,
                    backoff: parse_duration(&e.backoff)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        info!("notifications enabled for {} endpoints", endpoints.len());
        let (broadcaster, rx) = Broadcaster::new(1024);
        spawn_delivery_worker(rx, endpoints);
        Some(broadcaster)
    };

    // Background upload purging
    let purging = &config.storage.maintenance.uploadpurging;
    spawn_upload_purger(
        driver.clone(),
        UploadPurgeConfig {
            enabled: purging.enabled,
            age: parse_duration(&purging.age)?,
            interval: parse_duration(&purging.interval)?,
            dry_run: purging.dryrun,
        },
    );

    let metrics = init_metrics();

    let state: AppState = Arc::new(Services {
        namespace,
        auth,
        events,
        redirect_enabled: !config.storage.redirect.disable,
        metrics: metrics.map(Arc::new),
    });

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let bind = args.bind.unwrap_or(config.server.bind_address);
    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;

    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Initialize Prometheus metrics
fn init_metrics() -> Option<MetricsHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("prometheus metrics enabled at /metrics");
            metrics::describe_counter!(
                "drydock_events_delivered_total",
                "Notification events delivered per endpoint"
            );
            metrics::describe_counter!(
                "drydock_events_failed_total",
                "Notification events abandoned after retries"
            );
            metrics::describe_counter!(
                "drydock_events_dropped_total",
                "Notification events dropped due to queue saturation"
            );
            Some(handle)
        }
        Err(e) => {
            tracing::warn!("failed to initialize prometheus metrics: {}", e);
            None
        }
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received");
}

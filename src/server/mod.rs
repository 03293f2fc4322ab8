pub mod api;
pub mod dtos;
pub mod error;
pub mod extractors;
pub mod services;
pub mod utils;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    Extension, Router,
    http::{HeaderValue, Method},
    routing::get,
};
use once_cell::sync::Lazy;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::config::AppConfig;
use api::{
    catalog_controller::CatalogController, health_controller::health_endpoint,
    proxy_controller::ProxyController,
};
use services::edge_services::EdgeServices;

static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn get_uptime_seconds() -> u64 {
    STARTED_AT.elapsed().as_secs()
}

pub struct EdgeApplicationServer;

impl EdgeApplicationServer {
    /// `*` or a comma separated origin list, anything unparsable is dropped
    fn api_cors(cors_origin: &str) -> CorsLayer {
        let origin = if cors_origin.trim() == "*" {
            AllowOrigin::any()
        } else {
            let origins: Vec<HeaderValue> = cors_origin
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .filter_map(|o| match o.parse::<HeaderValue>() {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!("Ignoring invalid cors origin {}", o);
                        None
                    }
                })
                .collect();
            AllowOrigin::list(origins)
        };

        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers(Any)
    }

    /// the stream proxy sets its own CORS headers, the layer only wraps the json api
    pub fn router(services: EdgeServices) -> Router {
        let api = CatalogController::app().layer(Self::api_cors(&services.config.cors_origin));

        Router::new()
            .nest("/stream-proxy", ProxyController::app())
            .nest("/api/v1", api)
            .route("/health", get(health_endpoint))
            .layer(TraceLayer::new_for_http())
            .layer(Extension(services))
    }

    /// warms both snapshots at once so the first page load doesn't pay for them
    async fn warm_up(services: &EdgeServices) {
        let (channels, guide) = tokio::join!(services.current_channels(), services.current_guide());

        match channels {
            Ok(catalog) => info!(
                channels = catalog.channels.len(),
                diagnostic = ?catalog.diagnostic,
                "channel catalog loaded"
            ),
            Err(e) => warn!("channel catalog unavailable at startup: {}", e),
        }
        match guide {
            Ok(index) => info!(
                channels = index.channel_count(),
                programmes = index.programme_count(),
                skipped = index.skipped(),
                "guide loaded"
            ),
            Err(e) => warn!("guide unavailable at startup: {}", e),
        }
    }

    pub async fn serve(config: Arc<AppConfig>) -> anyhow::Result<()> {
        Lazy::force(&STARTED_AT);

        let services = EdgeServices::new(config.clone());
        Self::warm_up(&services).await;

        let app = Self::router(services);
        let address = format!("0.0.0.0:{}", config.port);
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .with_context(|| format!("binding to {}", address))?;

        info!(
            "routes initialized, listening on {} (stream proxy at {})",
            address,
            config.gateway_url()
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("failed to listen for shutdown signal: {}", e);
                }
                info!("shutdown signal received");
            })
            .await
            .context("error while starting server")?;

        Ok(())
    }
}

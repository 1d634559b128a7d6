//! Dashboard Module
//!
//! Read-only HTTP API over the collector service.
//! Only compiled when the `dashboard` feature is enabled.

mod api;

pub use api::create_router;

use serde::Serialize;
use std::sync::Arc;

use crate::collector::CollectorService;

/// JSON envelope for every API response
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Start the dashboard server
pub async fn start_server(service: Arc<CollectorService>, bind: &str) -> anyhow::Result<()> {
    let app = create_router(service);
    let listener = tokio::net::TcpListener::bind(bind).await?;

    tracing::info!("🖥️ Dashboard API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

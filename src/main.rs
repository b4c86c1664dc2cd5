use multipay::api::payments::{router, AppState};
use multipay::config::AppConfig;
use multipay::logging::init_tracing;
use multipay::payments::{
    Driver, DriverRegistry, EventBus, EventKind, PaymentConfig, PaymentEvent,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

/// Audit trail of every lifecycle event.
fn event_bus() -> EventBus {
    let mut events = EventBus::new();
    for kind in [EventKind::Purchase, EventKind::Pay, EventKind::Verify] {
        events.add_listener(kind, |event: &PaymentEvent<'_>| {
            info!(
                event = %event.kind(),
                driver = %event.driver().name(),
                invoice_id = %event.invoice().uuid(),
                transaction_id = ?event.invoice().transaction_id(),
                "Payment lifecycle event"
            );
            Ok(())
        });
    }
    events
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "🚀 Starting multipay callback service"
    );

    let payments = PaymentConfig::load(config.payments_config.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load payment configuration");
        e
    })?;
    let registry = DriverRegistry::from_config(payments);
    info!(
        default = %registry.default_driver(),
        drivers = %registry.names().join(","),
        "✅ Payment drivers registered"
    );

    let state = AppState::new(
        Arc::new(registry),
        Arc::new(event_bus()),
        config.server.public_base_url.clone(),
    );

    let app = router(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id()),
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("❌ Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(
        address = %addr,
        public_base_url = %config.server.public_base_url,
        "Server listening on http://{}",
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Server shutdown complete");

    Ok(())
}

//! HTTP server bootstrap.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use msaq_infra::Dispatcher;

use crate::app::build_app;

/// Serve the API on `address` until `cancel` fires.
pub async fn serve(
    dispatcher: Arc<Dispatcher>,
    address: &str,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(address).await?;
    serve_on(listener, dispatcher, cancel).await
}

/// Serve the API on an already bound listener until `cancel` fires.
pub async fn serve_on(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!(address = %listener.local_addr()?, "listening");

    axum::serve(listener, build_app(dispatcher))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("server stopped");
    Ok(())
}

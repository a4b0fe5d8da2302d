use axum::serve;
use std::future::Future;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::WebError;
use crate::routes::router;
use crate::state::WebState;

/// Serves the API until `shutdown` resolves.
pub async fn run_web_server<F>(bind_addr: &str, state: WebState, shutdown: F) -> Result<(), WebError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind_addr).await?;
    info!(bind = %bind_addr, "master api listening");
    serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| WebError::Internal {
            message: err.to_string(),
        })?;
    Ok(())
}

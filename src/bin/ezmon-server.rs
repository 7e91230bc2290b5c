//! Network store server for ezmon.
//!
//! Serves the RPC endpoints over one SQLite database per `(repo, job)`,
//! rooted at `EZMON_STORE_ROOT`. Configuration comes from the
//! environment:
//!
//! - `EZMON_STORE_ROOT`: directory of the per-(repo, job) databases
//!   (default `./ezmon-stores`)
//! - `EZMON_BIND`: listen address (default `0.0.0.0:3000`)
//! - `AUTH_TOKEN`: when set, every request must carry it as a bearer
//!   token

use ezmon::net::{ServerState, router};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let store_root =
        std::env::var("EZMON_STORE_ROOT").unwrap_or_else(|_| "./ezmon-stores".to_string());
    let bind = std::env::var("EZMON_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let auth_token = std::env::var("AUTH_TOKEN").ok();

    let state = ServerState::new(&store_root, auth_token);
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, %bind, "cannot bind");
            std::process::exit(ezmon::exit_code::INTERNAL);
        }
    };
    tracing::info!(%bind, store_root, "ezmon store server up");

    let serve = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    });
    if let Err(err) = serve.await {
        tracing::error!(error = %err, "server error");
        std::process::exit(ezmon::exit_code::INTERNAL);
    }
}

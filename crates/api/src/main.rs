use lifestream_api::AppState;
use lifestream_infra::{db, Config};

#[tokio::main]
async fn main() {
    lifestream_observability::init("lifestream-api");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            std::process::exit(2);
        }
    };

    let pool = match db::connect_pool(&config).await {
        Ok(pool) => pool,
        Err(err) => {
            tracing::error!(error = %err, "database connection failed");
            std::process::exit(2);
        }
    };
    if let Err(err) = db::ensure_schema(&pool).await {
        tracing::error!(error = %err, "schema bootstrap failed");
        std::process::exit(2);
    }

    let addr = std::env::var("API_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let app = lifestream_api::build_app(AppState::new(pool));

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(addr = %addr, error = %err, "failed to bind");
            std::process::exit(2);
        }
    };
    tracing::info!(addr = %addr, "ingestion endpoint listening");

    let mut shutdown = lifestream_infra::shutdown::signal_listener();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        while shutdown.changed().await.is_ok() {
            if *shutdown.borrow() {
                break;
            }
        }
    });

    if let Err(err) = serve.await {
        tracing::error!(error = %err, "server error");
        std::process::exit(2);
    }
}

use backend::{app, AppState};
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "backend=info,axum=info".into()),
        )
        .init();

    let db_path = env::var("DATABASE_PATH").unwrap_or_else(|_| "gachapon.db".to_string());
    let state = AppState::open(&db_path).expect("open database");

    if let (Ok(email), Ok(password)) = (env::var("ADMIN_EMAIL"), env::var("ADMIN_PASS")) {
        match state.seed_admin(&email, &password).await {
            Ok(id) => tracing::info!(user_id = id, %email, "admin account ready"),
            Err(err) => tracing::error!(%err, "admin seeding failed"),
        }
    }

    let port = env::var("PORT").unwrap_or_else(|_| "4000".to_string());
    let addr = format!("0.0.0.0:{port}");
    tracing::info!(%addr, "API running");
    axum::serve(
        tokio::net::TcpListener::bind(&addr).await.expect("bind"),
        app(state),
    )
    .await
    .expect("server error");
}

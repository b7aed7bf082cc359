use axum::{http::Method, Extension};
use campus_club_hub::{
    auth::Keys,
    config::Config,
    connect_to_db,
    email::Mailer,
    notify::{Notifier, SocketHub},
    oauth::GoogleAuth,
    push::PushSender,
    storage::FileStore,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::load()?);
    let keys = Keys::from_base64_secret(&config.jwt_secret)
        .map_err(|e| anyhow::anyhow!("JWT_SECRET is not usable: {e}"))?;

    let mailer = Mailer::from_config(&config)?;
    match &mailer {
        Some(mailer) => {
            if let Err(e) = mailer.sanity_check().await {
                tracing::warn!("email sanity check failed, emails may not arrive: {e:#}");
            }
        }
        None => tracing::warn!("EMAIL_USERNAME/EMAIL_PASSWORD not set, email is disabled"),
    }

    let push = PushSender::from_config(&config)?;
    if push.is_none() {
        tracing::warn!("VAPID_PRIVATE_KEY_PATH not set, web push is disabled");
    }

    let pool = connect_to_db(&config.db_url)?;
    let notifier = Notifier::new(pool.clone(), SocketHub::default(), push, mailer);
    let google = Arc::new(GoogleAuth::from_config(&config)?);
    let files = FileStore::from_config(&config)?;

    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .allow_origin(Any);
    let app = campus_club_hub::app()
        .layer(Extension(pool))
        .layer(Extension(keys))
        .layer(Extension(notifier))
        .layer(Extension(google))
        .layer(Extension(files))
        .layer(Extension(config.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

use axum::Router;
use deadpool::managed::Pool;
use diesel_async::{pooled_connection::AsyncDieselConnectionManager, AsyncPgConnection};

pub mod access;
pub mod api;
pub mod attendance;
pub mod auth;
pub mod config;
pub mod email;
pub mod error;
pub mod models;
pub mod notify;
pub mod oauth;
pub mod push;
pub mod schedule;
pub mod schema;
pub mod storage;
#[cfg(test)]
mod test_db;

pub type DbPool = Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

pub fn connect_to_db(db_url: &str) -> anyhow::Result<DbPool> {
    let db_config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    Ok(Pool::builder(db_config).build()?)
}

pub fn app() -> Router {
    Router::new().nest("/api", api::app())
}

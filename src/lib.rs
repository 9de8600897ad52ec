pub mod cash;
pub mod config;
pub mod consumers;
pub mod db;
pub mod error;
pub mod lock;
pub mod maintenance;
pub mod middleware;
pub mod models;
pub mod notify;
pub mod orders;
pub mod reservations;
pub mod retry;
pub mod routes;
pub mod schema;
pub mod state;
pub mod store;

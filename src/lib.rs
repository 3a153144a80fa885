pub mod api;
pub mod auth;
pub mod backends;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod models;
pub mod observability;
pub mod realtime;
pub mod state;
pub mod store;

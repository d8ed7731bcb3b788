pub mod auth;
pub mod cache;
pub mod client;
pub mod logger;
pub mod reference_store;
pub mod resolver;

// Tally session - library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;

pub mod config;
pub mod credential_store;
pub mod durable_store;
pub mod error;
pub mod logging;
pub mod time_entries_client;

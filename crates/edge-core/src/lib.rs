pub mod config;
pub mod date_bucket;
pub mod db;
pub mod edge_cache;
pub mod envelope;
pub mod http;
pub mod identity;
pub mod kv;
pub mod kv_postgres;
pub mod logging;
pub mod metrics;
pub mod migrations;
pub mod server;

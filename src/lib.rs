pub mod aggregator;
pub mod channel;
pub mod cleaner;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod fetcher;
pub mod integrity;
pub mod interpolate;
pub mod loader;
pub mod scheduler;
pub mod store;
pub mod wind;

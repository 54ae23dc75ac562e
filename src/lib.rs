pub mod closure;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod fingerprint;
pub mod orchestrator;
pub mod reconcile;

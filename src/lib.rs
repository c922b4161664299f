pub mod cache;
pub mod config;
pub mod db;
pub mod idle;
pub mod lock;
pub mod logging;
pub mod model;
pub mod node;
pub mod orchestrator;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod sandbox;
pub mod server;

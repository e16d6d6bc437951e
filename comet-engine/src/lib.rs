//! Pipeline execution engine
//!
//! Container executor, pipeline orchestrator and durable execution queue,
//! with Postgres and in-memory persistence.

pub mod config;
pub mod container;
pub mod db;
pub mod engine;
pub mod error;
pub mod queue;
pub mod repository;
pub mod service;

pub use config::EngineConfig;
pub use engine::Engine;

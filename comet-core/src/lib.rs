//! Comet Core
//!
//! Core types shared by the Comet pipeline execution engine.
//!
//! This crate contains:
//! - Domain types: pipeline runs, stage runs, queued jobs and broadcast events
//! - DTOs: requests and views exchanged with the trigger and admin layers

pub mod domain;
pub mod dto;

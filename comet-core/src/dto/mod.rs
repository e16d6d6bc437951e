//! Data Transfer Objects
//!
//! Requests accepted by the engine from trigger routes and the views it
//! returns to the administrative surface.

pub mod execution;
pub mod queue;

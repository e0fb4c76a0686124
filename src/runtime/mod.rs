//! Runtime system
//!
//! This module contains the worker pool (message-passing tasks) and the
//! shared-memory simulation pipeline.

pub mod pool;
pub mod simulation;

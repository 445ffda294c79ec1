//! Effectful layer: configuration, git state management, process execution,
//! generator and evaluator seams, durable records.

pub mod config;
pub mod evaluator;
pub mod generator;
pub mod outcome_store;
pub mod process;
pub mod rollback;
pub mod run_state;

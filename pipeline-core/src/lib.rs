pub mod action;
pub mod config;
pub mod context;
pub mod decision;
pub mod error;
pub mod event_log;
pub mod gateway;
pub mod hypothesis;
pub mod investigation;
pub mod orchestrator;
pub mod queue;
pub mod records;

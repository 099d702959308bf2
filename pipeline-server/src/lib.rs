pub mod monitor;
pub mod webhook;

pub mod bridge;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod fetch;
pub mod mode;
pub mod notice;
pub mod orchestrator;
pub mod player;
pub mod queue;
pub mod script;
pub mod storage;
pub mod vote;

#[cfg(test)]
pub(crate) mod test_support;

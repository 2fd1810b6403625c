//! Deployment pipeline: build, publish, swap, verify

pub mod builder;
pub mod channel;
pub mod fsm;
pub mod health;
pub mod mock;
pub mod orchestrator;
pub mod registry;
pub mod remote;
pub mod report;
pub mod retry;

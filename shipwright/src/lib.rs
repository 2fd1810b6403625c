//! shipwright library
//!
//! Single-host container deployments: build an image, publish it, swap it
//! in on the target and verify it, rolling back to the previous instance
//! when verification fails.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod storage;
pub mod utils;

pub mod artifact;
pub mod instance;
pub mod target;

//! Configuration and policy
//!
//! Game/executor configuration, file loading, and startup validation.

pub mod loader;
pub mod types;
pub mod validator;

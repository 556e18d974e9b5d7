// src/core/mod.rs

//! The central module containing spallocd's core logic and data structures:
//! the board/link hardware model, the per-machine async BMP controller, the
//! job and machine registries, and the allocator that ties them together.

pub mod abmc;
pub mod board;
pub mod controller;
pub mod errors;
pub mod hardware;
pub mod job;
pub mod machine;
pub mod metrics;
pub mod persistence;

pub use controller::Controller;
pub use errors::SpallocError;

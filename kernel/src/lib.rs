// Buildstream Kernel
//
// Ordered, resumable, authorized streaming of build events.

pub mod adapters;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod frame;
pub mod invariants;
pub mod log;
pub mod pipeline;
pub mod replay;
pub mod simulate;
pub mod state;
pub mod stream;
pub mod writer;

//! Background worker threads.
//!
//! ## Components
//!
//! - `CancellationToken`: cooperative shutdown flag shared by all workers
//! - `run_every`: runs a tick function every interval on the calling thread
//! - `Supervisor`: keeps named long-lived tasks alive, restarting dead ones

pub mod periodic;
pub mod supervisor;
pub mod token;

pub use periodic::run_every;
pub use supervisor::{RestartPolicy, Supervisor, SupervisorError};
pub use token::CancellationToken;

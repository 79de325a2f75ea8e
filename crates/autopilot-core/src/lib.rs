pub mod adapter;
pub mod catalog;
pub mod config;
pub mod decomposer;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gate;
pub mod hashing;
pub mod intent;
pub mod io;
pub mod lease;
pub mod machine;
pub mod paths;
pub mod plan;
pub mod pods;
pub mod policy;
pub mod router;
pub mod store;
pub mod task;
pub mod types;
pub mod worker;

pub use config::Config;
pub use engine::Engine;
pub use error::{AutopilotError, Result};
pub use machine::{NextTask, TaskStateMachine};
pub use store::{MemoryStore, RedbStore, Store};

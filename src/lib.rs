pub mod config;
pub mod context;
pub mod controller;
pub mod dashboard;
pub mod error;
pub mod naming;
pub mod node;
pub mod protocol;
pub mod run_state;
pub mod runtime;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

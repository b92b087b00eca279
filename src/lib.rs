pub mod cli;
pub mod error;
pub mod exec;
pub mod model;
pub mod privilege;
pub mod process;
pub mod runtime;
pub mod session;

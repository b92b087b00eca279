pub mod args;
pub mod config;
pub mod loader;
pub mod shell;

pub use args::Args;
pub use config::ConfigFile;
pub use loader::{Settings, SettingsLoader};

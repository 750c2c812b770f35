pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{AppConfig, DatabaseConfig, EngineConfig, LogFormat, LoggingConfig, MigrationsConfig};

mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, BusSettings, LogSettings, PartialSettings, PersistenceSettings,
    ServerSettings, Settings,
};

/// Environment variables are read as `PEEKLOCK_<SECTION>__<KEY>`,
/// e.g. `PEEKLOCK_BUS__LOCK_DURATION_SECS=30`.
pub const ENV_PREFIX: &str = "PEEKLOCK";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct with every section filled in
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::merge(partial))
}

#[cfg(test)]
mod tests;

mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{ClientSettings, LoggingSettings, ServerSettings, Settings};

/// Loads the configuration from the default file and environment variables
/// Environment variables use the `PATHCAST` prefix and `__` as the section
/// separator, e.g. `PATHCAST_SERVER__PORT=9000`
/// Returns a `Settings` struct with every missing value taken from the defaults
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("PATHCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}

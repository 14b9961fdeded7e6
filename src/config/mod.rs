mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{ClientSettings, LogSettings, ServerSettings, Settings};

/// Environment variable prefix, e.g. `DELIVERY_FEED__CLIENT__BACKEND_URL`.
pub const ENV_PREFIX: &str = "DELIVERY_FEED";

/// Loads the configuration from `config/default` and the environment,
/// then merges it over the default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

    let config = builder.build()?;

    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}

mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    AuthSettings, BrokerSettings, PersistenceSettings, ServerSettings, Settings, StoreBackend,
};

const DEFAULT_CONFIG_FILE: &str = "config/default";
const ENV_PREFIX: &str = "MQTT";

/// Loads the configuration from the default file and environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(None)
}

/// Loads `path` (or `config/default` when `None`), then overlays
/// `MQTT_<SECTION>__<KEY>` environment variables and fills anything left
/// unset from `Settings::default()`.
pub fn load_config_from(path: Option<&str>) -> Result<Settings, ConfigError> {
    let file = match path {
        Some(path) => File::with_name(path).required(true),
        None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };
    let builder = Config::builder().add_source(file).add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    Ok(Settings {
        server: ServerSettings {
            host: partial
                .server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: partial
                .server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
            connect_timeout_secs: partial
                .server
                .as_ref()
                .and_then(|s| s.connect_timeout_secs)
                .unwrap_or(default.server.connect_timeout_secs),
        },
        broker: BrokerSettings {
            max_qos: partial
                .broker
                .as_ref()
                .and_then(|b| b.max_qos)
                .unwrap_or(default.broker.max_qos),
            assign_client_ids: partial
                .broker
                .as_ref()
                .and_then(|b| b.assign_client_ids)
                .unwrap_or(default.broker.assign_client_ids),
            client_id_prefix: partial
                .broker
                .as_ref()
                .and_then(|b| b.client_id_prefix.clone())
                .unwrap_or(default.broker.client_id_prefix),
            max_client_id_length: partial
                .broker
                .as_ref()
                .and_then(|b| b.max_client_id_length)
                .unwrap_or(default.broker.max_client_id_length),
            allow_anonymous: partial
                .broker
                .as_ref()
                .and_then(|b| b.allow_anonymous)
                .unwrap_or(default.broker.allow_anonymous),
        },
        persistence: PersistenceSettings {
            backend: partial
                .persistence
                .as_ref()
                .and_then(|p| p.backend)
                .unwrap_or(default.persistence.backend),
            path: partial
                .persistence
                .as_ref()
                .and_then(|p| p.path.clone())
                .unwrap_or(default.persistence.path),
        },
        auth: AuthSettings {
            users: partial
                .auth
                .and_then(|a| a.users)
                .unwrap_or(default.auth.users),
        },
    })
}

#[cfg(test)]
mod tests;

use std::collections::HashMap;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the listener, the protocol engine, the subscription
/// store and client authentication.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub persistence: PersistenceSettings,
    pub auth: AuthSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the server will bind to, and how long a new
/// connection may take to send its CONNECT.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
}

/// Protocol policy handed to the engine.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    /// Highest QoS granted to any subscription.
    pub max_qos: u8,
    pub assign_client_ids: bool,
    pub client_id_prefix: String,
    pub max_client_id_length: usize,
    pub allow_anonymous: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sled,
}

/// Where subscriptions are kept.
#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceSettings {
    pub backend: StoreBackend,
    pub path: String,
}

/// Static credentials. An empty table accepts any username/password.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthSettings {
    pub users: HashMap<String, String>,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
    pub auth: Option<PartialAuthSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_qos: Option<u8>,
    pub assign_client_ids: Option<bool>,
    pub client_id_prefix: Option<String>,
    pub max_client_id_length: Option<usize>,
    pub allow_anonymous: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialPersistenceSettings {
    pub backend: Option<StoreBackend>,
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialAuthSettings {
    pub users: Option<HashMap<String, String>>,
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 1883,
                connect_timeout_secs: 10,
            },
            broker: BrokerSettings {
                max_qos: 2,
                assign_client_ids: true,
                client_id_prefix: "auto-".to_string(),
                max_client_id_length: 65_535,
                allow_anonymous: true,
            },
            persistence: PersistenceSettings {
                backend: StoreBackend::Memory,
                path: "subscriptions_db".to_string(),
            },
            auth: AuthSettings::default(),
        }
    }
}

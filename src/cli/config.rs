//! Settings that come from a config file or the environment rather than from flags.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{build_info::DEFAULT_CLIENT_ID, connection::SaslConfig};

/// Prefix of the environment variables, e.g. `KAFKA_CLI_USER`.
pub const ENV_PREFIX: &str = "KAFKA_CLI_";

/// Looked up in the home directory when `--config` is not given.
const DEFAULT_CONFIG_NAMES: &[&str] = &[".kafka-cli.yaml", ".kafka-cli.yml", ".kafka-cli.toml"];

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// SASL PLAIN user, authentication is off while empty.
    #[serde(deserialize_with = "scalar_string")]
    pub user: String,

    #[serde(deserialize_with = "scalar_string")]
    pub password: String,

    /// Replaces the client ID unless `--clientid` was given.
    #[serde(deserialize_with = "scalar_string")]
    pub client_id: String,
}

/// Environment values like `KAFKA_CLI_PASSWORD=1234` are parsed as numbers, read them back as text.
fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        String(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::String(s) => s,
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Bool(b) => b.to_string(),
    })
}

/// Settings and the config file they were read from, if any.
#[derive(Debug, Default)]
pub struct LoadedSettings {
    pub settings: Settings,
    pub path: Option<PathBuf>,
}

impl Settings {
    /// Layer defaults, the config file and `KAFKA_CLI_*` environment variables, later ones win.
    ///
    /// An explicitly given config file must exist, the default one in the home directory is optional.
    pub fn load(config: Option<&Path>) -> Result<LoadedSettings> {
        let path = match config {
            Some(path) => {
                if !path.is_file() {
                    anyhow::bail!("config file {} not found", path.display());
                }
                Some(path.to_path_buf())
            }
            None => default_config_file(),
        };

        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = &path {
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file(path)),
                _ => figment.merge(Yaml::file(path)),
            };
        }

        let settings = figment
            .merge(Env::prefixed(ENV_PREFIX).only(&["user", "password", "client_id"]))
            .extract()
            .context("invalid configuration")?;

        Ok(LoadedSettings { settings, path })
    }

    /// Credentials, if a user is configured.
    pub fn sasl_config(&self) -> Option<SaslConfig> {
        (!self.user.is_empty()).then(|| SaslConfig {
            username: self.user.clone(),
            password: self.password.clone(),
        })
    }

    /// The client ID to use given the `--clientid` flag.
    ///
    /// The configured ID only applies while the flag is left at its default.
    pub fn client_id(&self, flag: &str) -> String {
        if !self.client_id.is_empty() && flag == DEFAULT_CLIENT_ID {
            self.client_id.clone()
        } else {
            flag.to_owned()
        }
    }
}

fn default_config_file() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;

    DEFAULT_CONFIG_NAMES
        .iter()
        .map(|name| Path::new(&home).join(name))
        .find(|path| path.is_file())
}

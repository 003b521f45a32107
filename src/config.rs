//! # Configuration
//!
//! Settings are read from a TOML file, then overridden by prefixed environment variables
//! (`BRIDGE_BRIDGE__INBOUND_TOPIC=sensors/#` sets `bridge.inbound_topic`). String values may
//! reference other environment variables as `${VAR}` or `$VAR`; unset references are kept
//! verbatim.
//!
//! [figment](https://docs.rs/figment) does the merging and [doku](https://docs.rs/doku)
//! renders the commented sample written by `--generate`.

use std::path::{Path, PathBuf};

use doku::Document;
use figment::{
    providers::{Env, Format as _, Serialized, Toml},
    value::{Dict, Map, Value},
    Figment, Metadata, Profile, Provider,
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt as _;

use crate::broker::QoS;
use crate::telemetry::TelemetrySettings;
use crate::{ConfigFileMissingSnafu, ConfigFileWriteSnafu, ConfigLoadSnafu, Error};

/// Top level settings of a bridge process.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Document)]
pub struct Settings {
    /// Topics, QoS levels and channel sizing
    pub bridge: BridgeSettings,

    /// Logging, tracing and metrics export
    pub telemetry: TelemetrySettings,
}

/// How the bridge talks to the broker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Document)]
pub struct BridgeSettings {
    /// Topic filter subscribed to for inbound messages, MQTT wildcards allowed
    #[doku(example = "topic1")]
    pub inbound_topic: String,

    /// Delivery guarantee requested for the inbound subscription
    pub inbound_qos: QoS,

    /// Topic for outbound messages that do not name one
    #[doku(example = "topic1")]
    pub default_topic: String,

    /// Delivery guarantee used when publishing
    pub outbound_qos: QoS,

    /// Capacity of each hand-off channel; unbounded when absent
    #[doku(example = "1024")]
    pub channel_capacity: Option<usize>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            inbound_topic: "topic1".to_string(),
            inbound_qos: QoS::ExactlyOnce,
            default_topic: "topic1".to_string(),
            outbound_qos: QoS::default(),
            channel_capacity: None,
        }
    }
}

/// Resolves `${VAR}` and `$VAR` references to environment variables.
///
/// Anything else, and references to unset variables, come back unchanged.
///
/// ```
/// use mqtt_trace_bridge::config::expand_env_var;
///
/// assert_eq!(expand_env_var("sensors/#"), "sensors/#");
/// assert_eq!(expand_env_var("${BRIDGE_DOC_SURELY_UNSET}"), "${BRIDGE_DOC_SURELY_UNSET}");
/// ```
pub fn expand_env_var(value: &str) -> String {
    let name = value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .or_else(|| value.strip_prefix('$'));

    name.and_then(|name| std::env::var(name).ok())
        .unwrap_or_else(|| value.to_string())
}

fn expand_value(value: Value) -> Value {
    match value {
        Value::String(tag, text) => Value::String(tag, expand_env_var(&text)),
        Value::Dict(tag, dict) => Value::Dict(tag, expand_dict(dict)),
        Value::Array(tag, items) => {
            Value::Array(tag, items.into_iter().map(expand_value).collect())
        }
        other => other,
    }
}

fn expand_dict(dict: Dict) -> Dict {
    dict.into_iter()
        .map(|(key, value)| (key, expand_value(value)))
        .collect()
}

/// Provider serving another figment's merged data with env references resolved.
struct EnvExpander {
    data: Map<Profile, Dict>,
}

impl EnvExpander {
    fn from_figment(figment: &Figment) -> Result<Self, figment::Error> {
        let data = figment
            .data()?
            .into_iter()
            .map(|(profile, dict)| (profile, expand_dict(dict)))
            .collect();
        Ok(Self { data })
    }
}

impl Provider for EnvExpander {
    fn metadata(&self) -> Metadata {
        Metadata::named("env-expander")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Ok(self.data.clone())
    }
}

/// Writes a commented sample of `C` to `config_path`.
///
/// # Errors
/// - `ConfigFileWrite` if the file cannot be written.
pub fn create_config_file<C>(config_path: impl Into<PathBuf>) -> Result<(), Error>
where
    C: Document,
{
    let path = config_path.into();
    std::fs::write(&path, doku::to_toml::<C>()).context(ConfigFileWriteSnafu { path })?;
    Ok(())
}

/// Loaded configuration.
///
/// Precedence, lowest first: `C::default()`, the TOML file, prefixed environment variables.
/// Nested keys are joined with `__` in variable names.
#[derive(Debug)]
pub struct Config<C> {
    /// The merged configuration
    pub config: C,
}

impl<C> Config<C>
where
    C: for<'de> Deserialize<'de> + Serialize + Default,
{
    /// Loads from the optional file and the optional environment prefix.
    ///
    /// # Errors
    /// - `ConfigFileMissing` if a path is given but nothing exists there.
    /// - `ConfigLoad` if the file is unreadable or the merged values do not deserialize
    ///   into `C`.
    pub fn new<P, E>(config_path: Option<P>, env_prefix: Option<E>) -> Result<Self, Error>
    where
        P: AsRef<Path>,
        E: AsRef<str>,
    {
        let mut figment = Figment::from(Serialized::defaults(C::default()));
        if let Some(path) = config_path {
            let path = path.as_ref();
            if !path.exists() {
                return ConfigFileMissingSnafu { path }.fail();
            }
            figment = figment.merge(Toml::file(path));
        }
        if let Some(prefix) = env_prefix {
            figment = figment.merge(Env::prefixed(prefix.as_ref()).split("__"));
        }

        let expanded = EnvExpander::from_figment(&figment)
            .map_err(Box::new)
            .context(ConfigLoadSnafu)?;
        let config = Figment::from(expanded)
            .extract()
            .map_err(Box::new)
            .context(ConfigLoadSnafu)?;

        Ok(Self { config })
    }
}

impl Settings {
    /// Loads bridge settings; see [`Config::new`].
    ///
    /// # Errors
    /// - `ConfigLoad` as for [`Config::new`].
    pub fn load<P, E>(config_path: Option<P>, env_prefix: Option<E>) -> Result<Self, Error>
    where
        P: AsRef<Path>,
        E: AsRef<str>,
    {
        Config::new(config_path, env_prefix).map(|config| config.config)
    }
}

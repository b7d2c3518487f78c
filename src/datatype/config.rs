use toml;

use datatype::{Error, KeyType, Util};
use pacman::PacMan;


/// A container for all parsed configs.
#[derive(Deserialize, PartialEq, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub uptane:  UptaneConfig,
    pub storage: StorageConfig,
    pub pacman:  PacmanConfig,
}

impl Config {
    /// Read and merge one or more toml config files, later files taking
    /// precedence field by field.
    pub fn load(paths: &[String]) -> Result<Config, Error> {
        if paths.is_empty() {
            return Err(Error::Config("no config file given".into()));
        }
        let mut merged: Option<toml::Value> = None;
        for path in paths {
            info!("Loading config file: {}", path);
            let text = String::from_utf8(Util::read_file(path)
                .map_err(|err| Error::Config(format!("couldn't read config: {}", err)))?)?;
            let value = text.parse::<toml::Value>()?;
            merged = Some(match merged {
                Some(base) => merge_values(base, value),
                None => value,
            });
        }
        Config::parse_value(merged.expect("merged config"))
    }

    /// Parse a single toml config, using defaults for missing fields.
    pub fn parse(toml: &str) -> Result<Config, Error> {
        Config::parse_value(toml.parse::<toml::Value>()?)
    }

    fn parse_value(value: toml::Value) -> Result<Config, Error> {
        Ok(value.try_into::<Config>()?)
    }
}

/// Overlay `new` on top of `base`, recursing into tables.
fn merge_values(base: toml::Value, new: toml::Value) -> toml::Value {
    match (base, new) {
        (toml::Value::Table(mut base), toml::Value::Table(new)) => {
            for (key, val) in new {
                let merged = match base.remove(&key) {
                    Some(old) => merge_values(old, val),
                    None => val,
                };
                base.insert(key, merged);
            }
            toml::Value::Table(base)
        }
        (_, new) => new,
    }
}


/// The [network] configuration section.
#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub port:         u16,
    pub primary_ip:   String,
    pub primary_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            port:         9030,
            primary_ip:   "".into(),
            primary_port: 9040,
        }
    }
}


/// The [uptane] configuration section.
#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(default)]
pub struct UptaneConfig {
    pub ecu_serial:      String,
    pub ecu_hardware_id: String,
    pub key_type:        KeyType,
    pub force_install_completion: bool,
}

impl Default for UptaneConfig {
    fn default() -> Self {
        UptaneConfig {
            ecu_serial:      "".into(),
            ecu_hardware_id: "".into(),
            key_type:        KeyType::Ed25519,
            force_install_completion: false,
        }
    }
}


/// The [storage] configuration section.
#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig { path: "/var/sota".into() }
    }
}


/// The [pacman] configuration section.
#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(default)]
pub struct PacmanConfig {
    #[serde(rename = "type")]
    pub kind:        PacMan,
    pub images_path: String,
    pub sysroot:     String,
    pub os:          String,
}

impl Default for PacmanConfig {
    fn default() -> Self {
        PacmanConfig {
            kind:        PacMan::File,
            images_path: "/var/sota/images".into(),
            sysroot:     "/sysroot".into(),
            os:          "".into(),
        }
    }
}

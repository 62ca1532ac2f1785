use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub salt: SaltConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub interfaces: InterfacesConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SaltConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_eauth")]
    pub eauth: String,
    #[serde(default = "default_target")]
    pub target: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Wrap each cycle's updates in a single transaction.
    #[serde(default)]
    pub transactional: bool,
}

/// Interface names whose rx+tx counters are summed into the wired and
/// wireless totals. Sorted so the generated command is stable.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InterfacesConfig {
    #[serde(default = "default_wired")]
    pub wired: BTreeSet<String>,
    #[serde(default = "default_wireless")]
    pub wireless: BTreeSet<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            listen: None,
            salt: SaltConfig::default(),
            database: DatabaseConfig::default(),
            interfaces: InterfacesConfig::default(),
        }
    }
}

impl Default for SaltConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            eauth: default_eauth(),
            target: default_target(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_pg_port(),
            user: String::new(),
            password: String::new(),
            name: String::new(),
            max_connections: default_max_connections(),
            transactional: false,
        }
    }
}

impl Default for InterfacesConfig {
    fn default() -> Self {
        Self {
            wired: default_wired(),
            wireless: default_wireless(),
        }
    }
}

impl InterfacesConfig {
    /// Union of both sets in sorted order.
    pub fn all(&self) -> BTreeSet<&str> {
        self.wired
            .iter()
            .chain(self.wireless.iter())
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("некорректное значение переменной окружения {name}: {value}")]
    Env { name: &'static str, value: String },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    /// Reads the YAML file if present. A missing file is only an error when
    /// `required` is set, so the daemon can run purely from the environment.
    pub fn load(path: impl AsRef<Path>, required: bool) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        if !required && !path_ref.exists() {
            return Ok(Self::default());
        }
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })
    }

    /// Applies the deployment's environment variables on top of the file
    /// values. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut String, name: &str| {
            if let Some(v) = lookup(name) {
                *target = v;
            }
        };
        set(&mut self.salt.url, "SALT_API_URL");
        set(&mut self.salt.username, "SALT_API_USER");
        set(&mut self.salt.password, "SALT_API_PASSWORD");
        set(&mut self.database.host, "PG_HOST");
        set(&mut self.database.user, "PG_USER");
        set(&mut self.database.password, "PG_PASSWORD");
        set(&mut self.database.name, "PG_DB");

        if let Some(v) = lookup("PG_PORT") {
            self.database.port = v.trim().parse().map_err(|_| ConfigError::Env {
                name: "PG_PORT",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("SLEEP_TIME") {
            self.interval_secs = v.trim().parse().map_err(|_| ConfigError::Env {
                name: "SLEEP_TIME",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("FLEETD_LISTEN") {
            self.listen = Some(v).filter(|s| !s.trim().is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs должно быть >= 1".to_string(),
            ));
        }
        if let Some(listen) = &self.listen {
            if SocketAddr::from_str(listen).is_err() {
                return Err(ConfigError::Validation(
                    "поле listen должно быть корректным адресом host:port".to_string(),
                ));
            }
        }

        validate_salt(&self.salt)?;
        validate_database(&self.database)?;
        validate_interfaces(&self.interfaces)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_salt(cfg: &SaltConfig) -> Result<(), ConfigError> {
    if cfg.url.trim().is_empty() {
        return Err(ConfigError::Validation(
            "salt.url обязателен (или SALT_API_URL)".to_string(),
        ));
    }
    if cfg.username.trim().is_empty() {
        return Err(ConfigError::Validation(
            "salt.username обязателен (или SALT_API_USER)".to_string(),
        ));
    }
    if cfg.target.trim().is_empty() {
        return Err(ConfigError::Validation(
            "salt.target не должен быть пустым".to_string(),
        ));
    }
    Ok(())
}

fn validate_database(cfg: &DatabaseConfig) -> Result<(), ConfigError> {
    if cfg.host.trim().is_empty() {
        return Err(ConfigError::Validation(
            "database.host обязателен (или PG_HOST)".to_string(),
        ));
    }
    if cfg.user.trim().is_empty() {
        return Err(ConfigError::Validation(
            "database.user обязателен (или PG_USER)".to_string(),
        ));
    }
    if cfg.name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "database.name обязателен (или PG_DB)".to_string(),
        ));
    }
    if cfg.max_connections < 1 {
        return Err(ConfigError::Validation(
            "database.max_connections должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_interfaces(cfg: &InterfacesConfig) -> Result<(), ConfigError> {
    for name in cfg.wired.iter().chain(cfg.wireless.iter()) {
        if !is_interface_name(name) {
            return Err(ConfigError::Validation(format!(
                "недопустимое имя интерфейса '{name}'"
            )));
        }
    }
    if let Some(name) = cfg.wired.intersection(&cfg.wireless).next() {
        return Err(ConfigError::Validation(format!(
            "интерфейс '{name}' указан и в wired, и в wireless"
        )));
    }
    Ok(())
}

const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Linux interface names: 1..=15 bytes of `[A-Za-z0-9_.:-]`. Names end up
/// unquoted in a shell command run on every minion.
fn is_interface_name(name: &str) -> bool {
    (1..=MAX_INTERFACE_NAME_LEN).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b':' | b'-'))
}

const fn default_interval_secs() -> u64 {
    60 * 60
}

fn default_eauth() -> String {
    "pam".to_string()
}

fn default_target() -> String {
    "*".to_string()
}

const fn default_pg_port() -> u16 {
    5432
}

const fn default_max_connections() -> u32 {
    2
}

fn default_wired() -> BTreeSet<String> {
    ["eth0", "enp1s0"].into_iter().map(String::from).collect()
}

fn default_wireless() -> BTreeSet<String> {
    ["wlan0"].into_iter().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_config() -> Config {
        Config {
            interval_secs: 5,
            listen: None,
            salt: SaltConfig {
                url: "http://127.0.0.1:8000/run".to_string(),
                username: "collector".to_string(),
                password: "secret".to_string(),
                ..SaltConfig::default()
            },
            database: DatabaseConfig {
                host: "localhost".to_string(),
                user: "fleet".to_string(),
                name: "fleet".to_string(),
                ..DatabaseConfig::default()
            },
            interfaces: InterfacesConfig::default(),
        }
    }

    #[test]
    fn defaults_match_deployment() {
        let cfg = Config::default();
        assert_eq!(cfg.interval_secs, 3600);
        assert_eq!(cfg.salt.eauth, "pam");
        assert_eq!(cfg.salt.target, "*");
        assert_eq!(cfg.database.port, 5432);
        assert!(!cfg.database.transactional);
        assert_eq!(
            cfg.interfaces.all().into_iter().collect::<Vec<_>>(),
            vec!["enp1s0", "eth0", "wlan0"]
        );
    }

    #[test]
    fn example_yaml_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("пример разбирается");
        cfg.validate().expect("пример валиден");
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("SALT_API_URL", "https://salt.internal/run"),
            ("PG_PASSWORD", "pg-secret"),
            ("SLEEP_TIME", "120"),
            ("PG_PORT", "6432"),
        ]
        .into_iter()
        .collect();
        let mut cfg = valid_config();
        cfg.apply_env(|name| env.get(name).map(|v| v.to_string()))
            .expect("переменные корректны");

        assert_eq!(cfg.salt.url, "https://salt.internal/run");
        assert_eq!(cfg.salt.username, "collector");
        assert_eq!(cfg.database.password, "pg-secret");
        assert_eq!(cfg.database.port, 6432);
        assert_eq!(cfg.interval_secs, 120);
    }

    #[test]
    fn non_numeric_sleep_time_is_rejected() {
        let mut cfg = valid_config();
        let err = cfg
            .apply_env(|name| (name == "SLEEP_TIME").then(|| "hourly".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { name: "SLEEP_TIME", .. }));
    }

    #[test]
    fn overlapping_interface_sets_are_rejected() {
        let mut cfg = valid_config();
        cfg.interfaces.wireless.insert("eth0".to_string());
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn shell_metacharacters_in_interface_names_are_rejected() {
        for name in [
            "eth0$(reboot)",
            "eth0;reboot",
            "eth0`id`",
            "eth0|cat",
            "eth0&",
            "eth 0",
            "../eth0",
            "",
            "averyveryverylongif",
        ] {
            let mut cfg = valid_config();
            cfg.interfaces.wired.insert(name.to_string());
            assert!(
                matches!(cfg.validate(), Err(ConfigError::Validation(_))),
                "имя {name:?}"
            );
        }
    }

    #[test]
    fn usual_interface_names_are_accepted() {
        let mut cfg = valid_config();
        for name in ["enp0s31f6", "wlp2s0", "eth0.100", "br-lan", "eth0:1", "veth_a"] {
            cfg.interfaces.wired.insert(name.to_string());
        }
        cfg.validate().expect("имена допустимы");
    }

    #[test]
    fn missing_salt_url_and_zero_interval_are_rejected() {
        let mut cfg = valid_config();
        cfg.salt.url = " ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn invalid_listen_is_rejected() {
        let mut cfg = valid_config();
        cfg.listen = Some("not-an-address".to_string());
        assert!(cfg.validate().is_err());
        cfg.listen = Some("127.0.0.1:9109".to_string());
        cfg.validate().expect("адрес корректен");
    }

    #[test]
    fn missing_optional_file_falls_back_to_defaults() {
        let cfg = Config::load("/nonexistent/fleetd.yaml", false).expect("файл необязателен");
        assert_eq!(cfg.interval_secs, 3600);
        assert!(matches!(
            Config::load("/nonexistent/fleetd.yaml", true),
            Err(ConfigError::Read { .. })
        ));
    }
}

use std::{path::Path, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use zumic_channels_error::{ChannelsResult, GenericError, ResultExt, StackError, StatusCode};

use super::{BackendConfig, HubConfig, OverflowPolicy, StreamConfig};
use crate::logging::LoggingConfig;

/// Вид бэкенда в файле конфигурации.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Stream,
}

/// Настройки хаба в «плоском» виде, удобном для TOML и переменных окружения.
/// Длительности задаются в миллисекундах.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    pub backend: BackendKind,
    pub redis_url: String,
    pub key_prefix: String,
    pub max_backlog: usize,
    pub idle_ttl_ms: u64,
    pub sweep_interval_ms: u64,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub publish_retries: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub read_block_ms: u64,
    pub read_count: usize,
    pub cap_approximate: bool,
}

/// Полные настройки приложения.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub hub: HubSettings,
    pub logging: LoggingConfig,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Settings {
    /// Загружает настройки: значения по умолчанию, затем файл, затем
    /// переменные окружения `ZUMIC_CHANNELS__<СЕКЦИЯ>__<КЛЮЧ>`.
    ///
    /// Без явного пути файл `zumic-channels.{toml,yaml,json}` необязателен.
    pub fn load(path: Option<&Path>) -> ChannelsResult<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("zumic-channels").required(false),
        };

        let cfg = Self::builder(file)
            .map_err(config_error)
            .context("failed to load zumic-channels settings")?;

        cfg.try_deserialize()
            .map_err(config_error)
            .context("failed to parse zumic-channels settings")
    }

    fn builder<S>(file: S) -> Result<Config, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let defaults = HubSettings::default();
        Config::builder()
            // Значения по умолчанию
            .set_default("hub.backend", "memory")?
            .set_default("hub.max_backlog", defaults.max_backlog as u64)?
            .set_default("hub.queue_capacity", defaults.queue_capacity as u64)?
            .set_default("logging.level", "info")?
            .add_source(file)
            // Переменные окружения с префиксом ZUMIC_CHANNELS__
            .add_source(
                Environment::with_prefix("ZUMIC_CHANNELS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("logging.directives"),
            )
            .build()
    }

    /// Конфигурация хаба; проверяется при создании хаба.
    pub fn hub_config(&self) -> HubConfig {
        self.hub.to_hub_config()
    }
}

impl HubSettings {
    pub fn to_hub_config(&self) -> HubConfig {
        let backend = match self.backend {
            BackendKind::Memory => BackendConfig::Memory,
            BackendKind::Stream => BackendConfig::Stream(StreamConfig {
                url: self.redis_url.clone(),
                key_prefix: self.key_prefix.clone(),
                read_block: Duration::from_millis(self.read_block_ms),
                read_count: self.read_count,
                cap_approximate: self.cap_approximate,
            }),
        };

        HubConfig {
            backend,
            max_backlog: self.max_backlog,
            idle_ttl: Duration::from_millis(self.idle_ttl_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            queue_capacity: self.queue_capacity,
            overflow: self.overflow,
            publish_retries: self.publish_retries,
            retry_initial: Duration::from_millis(self.retry_initial_ms),
            retry_max: Duration::from_millis(self.retry_max_ms),
        }
    }
}

fn config_error(err: ConfigError) -> StackError {
    StackError::new(GenericError::new(StatusCode::InvalidConfig, err.to_string()))
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for HubSettings {
    fn default() -> Self {
        let hub = HubConfig::default();
        let stream = StreamConfig::default();
        Self {
            backend: BackendKind::Memory,
            redis_url: stream.url,
            key_prefix: stream.key_prefix,
            max_backlog: hub.max_backlog,
            idle_ttl_ms: hub.idle_ttl.as_millis() as u64,
            sweep_interval_ms: hub.sweep_interval.as_millis() as u64,
            queue_capacity: hub.queue_capacity,
            overflow: hub.overflow,
            publish_retries: hub.publish_retries,
            retry_initial_ms: hub.retry_initial.as_millis() as u64,
            retry_max_ms: hub.retry_max.as_millis() as u64,
            read_block_ms: stream.read_block.as_millis() as u64,
            read_count: stream.read_count,
            cap_approximate: stream.cap_approximate,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

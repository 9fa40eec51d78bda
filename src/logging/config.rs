use std::{env, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use zumic_channels_error::{ensure, ChannelsResult, StatusCode};

/// Формат вывода событий.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// Период ротации файла журнала.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

/// Файловый приёмник журнала.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub dir: PathBuf,
    pub filename: String,
    pub rotation: Rotation,
    /// Формат файла; по умолчанию JSON, чтобы журнал легко разбирался.
    pub format: LogFormat,
}

/// Конфигурация логирования.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Базовый уровень: trace, debug, info, warn, error.
    pub level: String,
    /// Дополнительные директивы вида `redis=warn`.
    pub directives: Vec<String>,
    pub format: LogFormat,
    pub with_ansi: bool,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_line_numbers: bool,
    /// Файловый приёмник; при `None` только консоль.
    pub file: Option<FileConfig>,
}

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl LoggingConfig {
    /// Переопределения из окружения: `ZUMIC_CHANNELS_LOG_LEVEL`,
    /// `ZUMIC_CHANNELS_LOG_FORMAT`, `ZUMIC_CHANNELS_LOG_DIR`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = env::var("ZUMIC_CHANNELS_LOG_LEVEL") {
            self.level = level.to_lowercase();
        }
        if let Ok(format) = env::var("ZUMIC_CHANNELS_LOG_FORMAT") {
            if let Ok(format) = format.parse() {
                self.format = format;
            }
        }
        if let Ok(dir) = env::var("ZUMIC_CHANNELS_LOG_DIR") {
            let file = self.file.get_or_insert_with(FileConfig::default);
            file.dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> ChannelsResult<()> {
        ensure!(
            LEVELS.contains(&self.level.as_str()),
            StatusCode::InvalidConfig,
            "unknown log level '{}'",
            self.level
        );
        for directive in &self.directives {
            ensure!(
                !directive.trim().is_empty(),
                StatusCode::InvalidConfig,
                "empty log directive"
            );
        }
        if let Some(file) = &self.file {
            ensure!(
                !file.filename.is_empty(),
                StatusCode::InvalidConfig,
                "log filename must not be empty"
            );
        }
        Ok(())
    }

    /// Директива для `EnvFilter`: базовый уровень плюс дополнительные.
    pub fn build_filter_directive(&self) -> String {
        let mut parts = Vec::with_capacity(self.directives.len() + 1);
        parts.push(self.level.clone());
        parts.extend(self.directives.iter().cloned());
        parts.join(",")
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directives: Vec::new(),
            format: LogFormat::Compact,
            with_ansi: true,
            with_target: true,
            with_thread_ids: false,
            with_line_numbers: false,
            file: None,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            filename: "zumic-channels.log".to_string(),
            rotation: Rotation::Daily,
            format: LogFormat::Json,
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

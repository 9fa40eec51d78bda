pub mod config;
mod filters;
mod formatter;
pub mod handle;

pub use config::{FileConfig, LogFormat, LoggingConfig, Rotation};
pub use handle::LoggingHandle;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Registry};
use zumic_channels_error::{ChannelsResult, GenericError, StackError, StatusCode};

/// Инициализация логирования с конфигурацией.
///
/// Устанавливает глобальный подписчик `tracing`; повторный вызов вернёт
/// ошибку.
pub fn init_logging(mut config: LoggingConfig) -> ChannelsResult<LoggingHandle> {
    config.apply_env_overrides();
    config.validate()?;

    let env_filter = filters::build_filter_from_config(&config);
    let mut layers: Vec<formatter::BoxedLayer<Registry>> = Vec::new();

    layers.push(formatter::build_formatter(
        &config,
        config.format,
        config.with_ansi,
        std::io::stderr,
    ));

    let file_guard = match &config.file {
        Some(file) => {
            std::fs::create_dir_all(&file.dir)?;
            let (writer, guard) = tracing_appender::non_blocking(file_appender(file));
            layers.push(formatter::build_formatter(
                &config,
                file.format,
                false,
                writer,
            ));
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| StackError::new(GenericError::new(StatusCode::Internal, e.to_string())))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        format = ?config.format,
        file_enabled = config.file.is_some(),
        "Logging system initialized"
    );

    Ok(LoggingHandle::new(file_guard))
}

fn file_appender(file: &FileConfig) -> RollingFileAppender {
    match file.rotation {
        Rotation::Hourly => rolling::hourly(&file.dir, &file.filename),
        Rotation::Daily => rolling::daily(&file.dir, &file.filename),
        Rotation::Never => rolling::never(&file.dir, &file.filename),
    }
}

use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::Layer as LayerTrait,
    registry::LookupSpan,
};

use crate::logging::config::{LogFormat, LoggingConfig};

/// Boxed-слой форматирования. Тип формата (json/pretty/compact) стирается,
/// чтобы слои разных форматов складывались в один `Vec`.
pub type BoxedLayer<S> = Box<dyn LayerTrait<S> + Send + Sync>;

/// Слой форматирования по конфигурации для произвольного writer.
pub fn build_formatter<S, W>(
    config: &LoggingConfig,
    format: LogFormat,
    with_ansi: bool,
    writer: W,
) -> BoxedLayer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(with_ansi)
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_line_number(config.with_line_numbers);

    match format {
        LogFormat::Json => Box::new(layer.json().with_current_span(true)),
        LogFormat::Pretty => Box::new(layer.pretty().with_span_events(FmtSpan::CLOSE)),
        LogFormat::Compact => Box::new(layer.compact()),
    }
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::{prelude::*, registry::Registry};

    use super::*;

    /// Тест проверяет, что слой каждого формата строится и принимает события.
    #[test]
    fn test_every_format_builds() {
        let config = LoggingConfig::default();
        for format in [LogFormat::Compact, LogFormat::Pretty, LogFormat::Json] {
            let layer = build_formatter::<Registry, _>(&config, format, false, std::io::sink);
            let subscriber = Registry::default().with(layer);
            tracing::subscriber::with_default(subscriber, || {
                tracing::info!(channel = "news", "formatter smoke test");
            });
        }
    }
}

use tracing_subscriber::EnvFilter;

use crate::logging::config::LoggingConfig;

/// Строит фильтр: `RUST_LOG` имеет приоритет над конфигурацией.
pub fn build_filter_from_config(config: &LoggingConfig) -> EnvFilter {
    let directive = config.build_filter_directive();

    match EnvFilter::try_from_default_env() {
        Ok(env_filter) => env_filter,
        Err(_) => match EnvFilter::try_new(&directive) {
            Ok(filter) => filter,
            Err(e) => {
                // Подписчик ещё не установлен, tracing здесь некуда писать
                eprintln!(
                    "Invalid log filter directive from config ('{directive}'): {e}; falling back to 'info'"
                );
                EnvFilter::new("info")
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tracing_subscriber::{fmt, prelude::*, registry::Registry};

    use super::*;

    // Мини-буферный writer для тестов
    struct VecMakeWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for VecMakeWriter {
        type Writer = VecWriterGuard;

        fn make_writer(&'a self) -> Self::Writer {
            VecWriterGuard(self.0.clone())
        }
    }

    struct VecWriterGuard(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for VecWriterGuard {
        fn write(
            &mut self,
            buf: &[u8],
        ) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Тест проверяет, что некорректная директива не роняет построение
    /// фильтра.
    #[test]
    fn test_invalid_directive_falls_back() {
        let config = LoggingConfig {
            level: "info".to_string(),
            directives: vec!["this_is=invalid=directive".to_string()],
            ..Default::default()
        };
        let _filter = build_filter_from_config(&config);
    }

    /// Тест проверяет фильтрацию по уровню: при "warn" info-события
    /// отбрасываются.
    #[test]
    fn test_filter_levels() {
        let filter = EnvFilter::try_new("warn").expect("failed to build env filter");

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let layer = fmt::layer()
            .with_writer(VecMakeWriter(buffer.clone()))
            .with_ansi(false)
            .with_filter(filter);
        let subscriber = Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("info message that should be filtered out");
            tracing::warn!("warn message that should pass through");
        });

        let out = buffer.lock().unwrap();
        let s = String::from_utf8_lossy(&out);
        assert!(s.contains("warn message that should pass through"));
        assert!(!s.contains("info message that should be filtered out"));
    }
}

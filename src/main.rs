//! CLI хаба каналов Zumic
//!
//! Публикует сообщения, читает историю и слушает каналы через тот же хаб,
//! что используется библиотекой. С бэкендом `stream` несколько процессов
//! видят одни и те же каналы.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde::Serialize;
use tracing::debug;
use zumic_channels::{
    init_logging, BackendKind, Hub, Message, OverflowPolicy, Replay, Settings, SubscribeOptions,
};

/// Аргументы командной строки
#[derive(Parser)]
#[command(name = "zumic-channels")]
#[command(author = "Zumic Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Zumic Channels - pub/sub hub over memory or Redis Streams", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Путь к файлу конфигурации
    #[arg(
        short,
        long,
        env = "ZUMIC_CHANNELS_CONFIG",
        help = "Файл конфигурации (toml, yaml или json)"
    )]
    config: Option<PathBuf>,
    /// Бэкенд хаба
    #[arg(long, value_enum, help = "Бэкенд: memory или stream")]
    backend: Option<BackendArg>,
    /// Адрес Redis для бэкенда stream
    #[arg(long, help = "Адрес Redis, например redis://127.0.0.1:6379")]
    redis_url: Option<String>,
    /// Политика переполнения очереди подписки
    #[arg(long, value_enum, help = "Политика переполнения: drop-oldest или disconnect")]
    overflow: Option<OverflowArg>,
    /// Включить подробный вывод (debug)
    #[arg(short, long, help = "Включить подробный вывод для отладки")]
    verbose: bool,
    /// Подавить большинство логов (только warn/error)
    #[arg(short = 'q', long, help = "Подавить логирование (только warn/error)")]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum BackendArg {
    Memory,
    Stream,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OverflowArg {
    DropOldest,
    Disconnect,
}

/// Подкоманды CLI
#[derive(Subcommand)]
enum Commands {
    /// Опубликовать сообщение
    #[command(alias = "pub")]
    Publish {
        #[arg(help = "Имя канала")]
        channel: String,
        #[arg(help = "Полезная нагрузка (строка)")]
        payload: String,
    },
    /// Показать последние сообщения канала
    History {
        #[arg(help = "Имя канала")]
        channel: String,
        #[arg(
            short = 'n',
            long,
            default_value = "10",
            help = "Сколько последних сообщений показать"
        )]
        limit: usize,
    },
    /// Слушать каналы и печатать сообщения построчно в JSON
    #[command(alias = "sub")]
    Listen {
        #[arg(required = true, help = "Имена каналов")]
        channels: Vec<String>,
        #[arg(long, help = "Сначала выдать хранимую историю")]
        replay: bool,
        #[arg(long, help = "Выдать не больше N последних сообщений истории")]
        last: Option<usize>,
        #[arg(short = 'c', long, help = "Завершиться после N сообщений")]
        count: Option<usize>,
    },
    /// Удалить простаивающие каналы
    Sweep,
    /// Удалить все каналы бэкенда
    Flush,
    /// Сведения о сборке и конфигурации
    Info,
}

/// Представление сообщения для вывода.
#[derive(Serialize)]
struct MessageView<'a> {
    channel: &'a str,
    id: String,
    timestamp: String,
    payload: String,
}

impl<'a> From<&'a Message> for MessageView<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            channel: message.channel.as_str(),
            id: message.id.to_string(),
            timestamp: message.timestamp.to_rfc3339(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings =
        Settings::load(cli.config.as_deref()).map_err(|e| anyhow::anyhow!("{e}"))?;
    apply_cli_overrides(&cli, &mut settings);

    let logging =
        init_logging(settings.logging.clone()).map_err(|e| anyhow::anyhow!("{e}"))?;

    let result = run(cli.command, &settings).await;
    logging.shutdown().await;
    result
}

fn apply_cli_overrides(
    cli: &Cli,
    settings: &mut Settings,
) {
    if let Some(backend) = cli.backend {
        settings.hub.backend = match backend {
            BackendArg::Memory => BackendKind::Memory,
            BackendArg::Stream => BackendKind::Stream,
        };
    }
    if let Some(url) = &cli.redis_url {
        settings.hub.redis_url = url.clone();
        settings.hub.backend = BackendKind::Stream;
    }
    if let Some(overflow) = cli.overflow {
        settings.hub.overflow = match overflow {
            OverflowArg::DropOldest => OverflowPolicy::DropOldest,
            OverflowArg::Disconnect => OverflowPolicy::Disconnect,
        };
    }
    if cli.verbose {
        settings.logging.level = "debug".into();
    } else if cli.quiet {
        settings.logging.level = "warn".into();
    }
}

async fn run(
    command: Commands,
    settings: &Settings,
) -> Result<()> {
    if let Commands::Info = command {
        return print_info(settings);
    }

    let hub = Hub::new(settings.hub_config())
        .await
        .context("failed to start channels hub")?;
    debug!(backend = hub.backend_name(), "Hub ready");

    let result = execute(&hub, command).await;
    hub.shutdown().await;
    result
}

async fn execute(
    hub: &Hub,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Publish { channel, payload } => {
            let message = hub.publish(channel, payload).await?;
            print_json(&MessageView::from(&message))
        }
        Commands::History { channel, limit } => {
            for message in hub.history(channel, limit).await? {
                print_json(&MessageView::from(&message))?;
            }
            Ok(())
        }
        Commands::Listen {
            channels,
            replay,
            last,
            count,
        } => {
            let replay = match (last, replay) {
                (Some(n), _) => Replay::Last(n),
                (None, true) => Replay::All,
                (None, false) => Replay::None,
            };
            let subscription = hub
                .subscribe_with(channels, SubscribeOptions::replay(replay))
                .await?;
            listen(subscription, count).await
        }
        Commands::Sweep => print_json(&hub.sweep_now().await?),
        Commands::Flush => {
            let removed = hub.flush_all().await?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
        Commands::Info => Ok(()),
    }
}

async fn listen(
    subscription: zumic_channels::Subscription,
    count: Option<usize>,
) -> Result<()> {
    let limit = count.unwrap_or(usize::MAX);
    let mut stream = Box::pin(subscription.into_stream().take(limit));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = stream.next() => match next {
                Some(Ok(message)) => print_json(&MessageView::from(&message))?,
                Some(Err(e)) => return Err(e.into()),
                None => break,
            },
        }
    }
    Ok(())
}

fn print_info(settings: &Settings) -> Result<()> {
    let info = serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "git_commit": env!("GIT_COMMIT"),
        "build_time": env!("BUILD_TIME"),
        "hub": settings.hub,
    });
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;
use smtp_tg_relay::blocklist::SenderBlocklist;
use smtp_tg_relay::config::{self, ChatConfig, RelayConfig, SmtpConfig, DEFAULT_MESSAGE_TEMPLATE};
use smtp_tg_relay::filter::{FilterEngine, RuleSet};
use smtp_tg_relay::smtp::{ShutdownOutcome, SmtpServer};
use smtp_tg_relay::{BotApi, Relay};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

fn cli() -> Command {
    Command::new("smtp-tg-relay")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Listens for SMTP and sends all incoming email messages to Telegram")
        .arg(
            Arg::new("smtp-listen")
                .long("smtp-listen")
                .value_name("ADDR")
                .env("ST_SMTP_LISTEN")
                .help("SMTP: TCP address to listen to")
                .default_value("127.0.0.1:2525"),
        )
        .arg(
            Arg::new("smtp-primary-host")
                .long("smtp-primary-host")
                .value_name("HOST")
                .env("ST_SMTP_PRIMARY_HOST")
                .help("SMTP: primary host [default: machine hostname]"),
        )
        .arg(
            Arg::new("smtp-allowed-hosts")
                .long("smtp-allowed-hosts")
                .value_name("HOSTS")
                .env("ST_SMTP_ALLOWED_HOSTS")
                .help("SMTP: allowed hosts separated by comma, default is any")
                .default_value("."),
        )
        .arg(
            Arg::new("smtp-max-envelope-size")
                .long("smtp-max-envelope-size")
                .value_name("SIZE")
                .env("ST_SMTP_MAX_ENVELOPE_SIZE")
                .help("Max size of an incoming Email. Examples: 5k, 10m.")
                .default_value("50m"),
        )
        .arg(
            Arg::new("config-file")
                .short('c')
                .long("config-file")
                .value_name("FILE")
                .env("ST_CONFIG_FILE")
                .help("YAML file with filter_rules"),
        )
        .arg(
            Arg::new("blacklist-file")
                .long("blacklist-file")
                .value_name("FILE")
                .env("ST_BLACKLIST_FILE")
                .help("File with blacklisted email addresses or domains (one per line)"),
        )
        .arg(
            Arg::new("telegram-chat-ids")
                .long("telegram-chat-ids")
                .value_name("IDS")
                .env("ST_TELEGRAM_CHAT_IDS")
                .help("Telegram: comma-separated list of chat ids")
                .required_unless_present("test-config"),
        )
        .arg(
            Arg::new("telegram-bot-token")
                .long("telegram-bot-token")
                .value_name("TOKEN")
                .env("ST_TELEGRAM_BOT_TOKEN")
                .hide_env_values(true)
                .help("Telegram: bot token")
                .required_unless_present("test-config"),
        )
        .arg(
            Arg::new("telegram-api-prefix")
                .long("telegram-api-prefix")
                .value_name("URL")
                .env("ST_TELEGRAM_API_PREFIX")
                .help("Telegram: API url prefix")
                .default_value("https://api.telegram.org/"),
        )
        .arg(
            Arg::new("message-template")
                .long("message-template")
                .value_name("TEMPLATE")
                .env("ST_TELEGRAM_MESSAGE_TEMPLATE")
                .help("Telegram message template")
                .default_value(DEFAULT_MESSAGE_TEMPLATE),
        )
        .arg(
            Arg::new("telegram-api-timeout-seconds")
                .long("telegram-api-timeout-seconds")
                .value_name("SECONDS")
                .env("ST_TELEGRAM_API_TIMEOUT_SECONDS")
                .help("HTTP timeout used for requests to the Telegram API")
                .value_parser(clap::value_parser!(f64))
                .default_value("30"),
        )
        .arg(
            Arg::new("forwarded-attachment-max-size")
                .long("forwarded-attachment-max-size")
                .value_name("SIZE")
                .env("ST_FORWARDED_ATTACHMENT_MAX_SIZE")
                .help(
                    "Max size of an attachment to be forwarded to telegram. \
                     0 -- disable forwarding. Examples: 5k, 10m. \
                     Telegram API has a 50m limit on their side.",
                )
                .default_value("10m"),
        )
        .arg(
            Arg::new("forwarded-attachment-max-photo-size")
                .long("forwarded-attachment-max-photo-size")
                .value_name("SIZE")
                .env("ST_FORWARDED_ATTACHMENT_MAX_PHOTO_SIZE")
                .help(
                    "Max size of a photo attachment to be forwarded to telegram. \
                     0 -- disable forwarding. Examples: 5k, 10m. \
                     Telegram API has a 10m limit on their side.",
                )
                .default_value("10m"),
        )
        .arg(
            Arg::new("forwarded-attachment-respect-errors")
                .long("forwarded-attachment-respect-errors")
                .env("ST_FORWARDED_ATTACHMENT_RESPECT_ERRORS")
                .help("Reject the whole email if some attachments could not have been forwarded")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("message-length-to-send-as-file")
                .long("message-length-to-send-as-file")
                .value_name("CHARS")
                .env("ST_MESSAGE_LENGTH_TO_SEND_AS_FILE")
                .help(
                    "If message length is greater than this number, it is sent truncated \
                     followed by a text file containing the full message. \
                     Telegram API has a limit of 4096 chars per message.",
                )
                .value_parser(clap::value_parser!(usize))
                .default_value("4095"),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the filter rules file and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
}

fn string_arg(matches: &ArgMatches, name: &str) -> Option<String> {
    matches.get_one::<String>(name).cloned()
}

fn size_arg(matches: &ArgMatches, name: &str) -> anyhow::Result<usize> {
    let value = matches.get_one::<String>(name).map(String::as_str).unwrap_or("0");
    let size = config::parse_human_size(value).with_context(|| format!("--{name}"))?;
    Ok(size as usize)
}

fn relay_config(matches: &ArgMatches) -> anyhow::Result<RelayConfig> {
    let smtp = SmtpConfig {
        listen: string_arg(matches, "smtp-listen").unwrap_or_default(),
        primary_host: string_arg(matches, "smtp-primary-host").unwrap_or_else(config::hostname),
        max_envelope_size: size_arg(matches, "smtp-max-envelope-size")?,
        allowed_hosts: config::parse_allowed_hosts(
            matches
                .get_one::<String>("smtp-allowed-hosts")
                .map(String::as_str)
                .unwrap_or(""),
        ),
        config_file: matches.get_one::<String>("config-file").map(PathBuf::from),
        blacklist_file: matches.get_one::<String>("blacklist-file").map(PathBuf::from),
        ..Default::default()
    };

    let timeout = matches
        .get_one::<f64>("telegram-api-timeout-seconds")
        .copied()
        .unwrap_or(30.0);
    let api_timeout = Duration::try_from_secs_f64(timeout)
        .with_context(|| format!("--telegram-api-timeout-seconds: invalid value {timeout}"))?;

    let chat = ChatConfig {
        chat_ids: string_arg(matches, "telegram-chat-ids").unwrap_or_default(),
        bot_token: string_arg(matches, "telegram-bot-token").unwrap_or_default(),
        api_prefix: string_arg(matches, "telegram-api-prefix").unwrap_or_default(),
        api_timeout,
        message_template: string_arg(matches, "message-template")
            .unwrap_or_else(|| DEFAULT_MESSAGE_TEMPLATE.to_string()),
        forwarded_attachment_max_size: size_arg(matches, "forwarded-attachment-max-size")?,
        forwarded_attachment_max_photo_size: size_arg(matches, "forwarded-attachment-max-photo-size")?,
        forwarded_attachment_respect_errors: matches.get_flag("forwarded-attachment-respect-errors"),
        message_length_to_send_as_file: matches
            .get_one::<usize>("message-length-to-send-as-file")
            .copied()
            .unwrap_or(4095),
    };

    Ok(RelayConfig { smtp, chat })
}

fn test_config(path: Option<&Path>) {
    let Some(path) = path else {
        println!("No filter rules file configured, every message will be relayed.");
        return;
    };
    println!("🔍 Testing configuration {}...", path.display());
    match RuleSet::from_file(path) {
        Ok(rules) => {
            println!("Number of filter rules: {}", rules.len());
            for (i, rule) in rules.rules().iter().enumerate() {
                println!("  Rule {}: {} ({:?}, {} conditions)", i + 1, rule.name, rule.mode, rule.condition_count());
            }
            println!("All regex patterns compiled successfully.");
        }
        Err(e) => {
            println!("❌ Configuration validation failed:");
            println!("Error: {e}");
            process::exit(1);
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut term, mut quit) = match (signal(SignalKind::terminate()), signal(SignalKind::quit())) {
        (Ok(term), Ok(quit)) => (term, quit),
        _ => {
            log::warn!("Unable to install SIGTERM/SIGQUIT handlers, only Ctrl-C will stop the server");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
        _ = quit.recv() => {}
    }
    log::info!("Shutdown signal caught");
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("Shutdown signal caught");
}

/// Reload filter rules on every SIGHUP. A broken file leaves the active
/// rules in place.
#[cfg(unix)]
fn spawn_reload_handler(filters: Arc<FilterEngine>, path: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            log::warn!("Unable to install SIGHUP handler, rule reload disabled: {}", e);
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match filters.reload(&path) {
                Ok(count) => log::info!("Reloaded {} filter rules from {}", count, path.display()),
                Err(e) => log::error!("Failed to reload filter rules, keeping previous set: {}", e),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_handler(_filters: Arc<FilterEngine>, _path: PathBuf) {}

async fn run(config: RelayConfig) -> anyhow::Result<ShutdownOutcome> {
    let filters = Arc::new(FilterEngine::load(config.smtp.config_file.as_deref())?);
    let blocklist = SenderBlocklist::load(config.smtp.blacklist_file.as_deref())?;
    let api = BotApi::new(&config.chat)?;
    let relay = Arc::new(Relay::new(config.chat, Arc::clone(&filters), blocklist, api));

    if let Some(path) = config.smtp.config_file.clone() {
        spawn_reload_handler(Arc::clone(&filters), path);
    }

    let server = Arc::new(SmtpServer::new(config.smtp, relay));
    let listener = server.bind().await.context("failed to start SMTP listener")?;
    Ok(server.serve(listener, shutdown_signal()).await)
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let config = match relay_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(config.smtp.config_file.as_deref());
        return;
    }

    log::info!("Starting smtp-tg-relay...");
    match run(config).await {
        Ok(ShutdownOutcome::Clean) => log::info!("Shutdown completed, exiting."),
        Ok(ShutdownOutcome::TimedOut) => {
            log::error!("graceful shutdown timed out");
            process::exit(1);
        }
        Err(e) => {
            log::error!("{e:#}");
            process::exit(1);
        }
    }
}

use anyhow::{anyhow, Context};
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MESSAGE_TEMPLATE: &str =
    "From: {from}\\nTo: {to}\\nSubject: {subject}\\n\\n{body}\\n\\n{attachments_details}";

/// Everything a running relay needs: the SMTP listener settings and the
/// chat-side formatting and delivery settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub smtp: SmtpConfig,
    pub chat: ChatConfig,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub listen: String,
    pub primary_host: String,
    /// Maximum size of an incoming envelope, in bytes.
    pub max_envelope_size: usize,
    /// Recipient domains accepted at `RCPT TO`. A single `.` accepts any.
    pub allowed_hosts: Vec<String>,
    /// YAML file holding `filter_rules`.
    pub config_file: Option<PathBuf>,
    pub blacklist_file: Option<PathBuf>,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Comma-separated destination chat identifiers.
    pub chat_ids: String,
    pub bot_token: String,
    pub api_prefix: String,
    pub api_timeout: Duration,
    pub message_template: String,
    /// Byte ceiling for documents, including the synthetic full-message file.
    /// Zero disables document forwarding.
    pub forwarded_attachment_max_size: usize,
    /// Byte ceiling for photos. Zero disables photo forwarding.
    pub forwarded_attachment_max_photo_size: usize,
    /// Reject the whole email when an attachment could not be delivered.
    pub forwarded_attachment_respect_errors: bool,
    /// Code-point threshold above which the text is truncated and the full
    /// rendering is sent as a file.
    pub message_length_to_send_as_file: usize,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        SmtpConfig {
            listen: "127.0.0.1:2525".to_string(),
            primary_host: "localhost".to_string(),
            max_envelope_size: 50_000_000,
            allowed_hosts: vec![".".to_string()],
            config_file: None,
            blacklist_file: None,
            read_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            chat_ids: String::new(),
            bot_token: String::new(),
            api_prefix: "https://api.telegram.org/".to_string(),
            api_timeout: Duration::from_secs(30),
            message_template: DEFAULT_MESSAGE_TEMPLATE.to_string(),
            forwarded_attachment_max_size: 10_000_000,
            forwarded_attachment_max_photo_size: 10_000_000,
            forwarded_attachment_respect_errors: false,
            message_length_to_send_as_file: 4095,
        }
    }
}

impl ChatConfig {
    /// Destination chat identifiers in configured order.
    ///
    /// Each id is trimmed and empty entries (`"42,,142"`, a trailing comma)
    /// are skipped instead of being sent to the API as an empty chat.
    pub fn chat_ids(&self) -> impl Iterator<Item = &str> {
        self.chat_ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Split a comma-separated host list. An empty list means "any host".
pub fn parse_allowed_hosts(value: &str) -> Vec<String> {
    let hosts: Vec<String> = value
        .split(',')
        .map(|h| h.trim().to_lowercase())
        .collect();
    if hosts.len() == 1 && hosts[0].is_empty() {
        return vec![".".to_string()];
    }
    hosts
}

/// Parse a human-readable size such as `5k`, `10m`, `1.5MB` or `512`.
/// Multipliers are decimal (k = 1000).
pub fn parse_human_size(value: &str) -> anyhow::Result<u64> {
    let re = Regex::new(r"^(\d+(?:\.\d+)?) ?([kKmMgGtTpP])?[iI]?[bB]?$")?;
    let caps = re
        .captures(value.trim())
        .ok_or_else(|| anyhow!("invalid size: '{}'", value))?;

    let number: f64 = caps[1]
        .parse()
        .with_context(|| format!("invalid size: '{value}'"))?;
    let multiplier: f64 = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 1.0,
        Some(unit) => match unit.as_str() {
            "k" => 1e3,
            "m" => 1e6,
            "g" => 1e9,
            "t" => 1e12,
            "p" => 1e15,
            _ => return Err(anyhow!("invalid size unit in '{}'", value)),
        },
    };

    Ok((number * multiplier) as u64)
}

const SIZE_UNITS: [&str; 9] = ["B", "kB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Format a byte count with decimal units and 4 significant digits,
/// e.g. `3B`, `1.024kB`, `10MB`.
pub fn human_size(bytes: usize) -> String {
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1000.0 && unit < SIZE_UNITS.len() - 1 {
        size /= 1000.0;
        unit += 1;
    }
    format!("{}{}", format_significant(size, 4), SIZE_UNITS[unit])
}

fn format_significant(value: f64, digits: i32) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let exponent = value.abs().log10().floor() as i32;
    let decimals = (digits - 1 - exponent).max(0) as usize;
    let mut s = format!("{value:.decimals$}");
    if s.contains('.') {
        s = s.trim_end_matches('0').trim_end_matches('.').to_string();
    }
    s
}

/// The machine hostname, used as the default SMTP primary host.
pub fn hostname() -> String {
    match hostname::get().map(|h| h.into_string()) {
        Ok(Ok(name)) if !name.is_empty() => name,
        _ => {
            log::warn!("Unable to detect hostname, falling back to localhost");
            "localhost".to_string()
        }
    }
}

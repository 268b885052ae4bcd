pub mod attachment;
pub mod blocklist;
pub mod config;
pub mod error;
pub mod filter;
pub mod format;
pub mod mime;
pub mod relay;
pub mod smtp;
pub mod telegram;

pub use config::{ChatConfig, RelayConfig, SmtpConfig};
pub use filter::{FilterEngine, FilterInput, RuleSet};
pub use relay::Relay;
pub use telegram::{BotApi, ChatApi};

use thiserror::Error;

/// Errors raised while loading or compiling a filter rule file.
///
/// Any of these aborts the whole load: a rule set is either compiled in full
/// or not activated at all.
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("rule '{rule}': invalid match type '{value}' (expected 'all' or 'any')")]
    InvalidMatchType { rule: String, value: String },

    #[error("rule '{rule}': invalid field '{field}'")]
    InvalidField { rule: String, field: String },

    #[error("rule '{rule}': invalid regex pattern '{pattern}': {source}")]
    InvalidPattern {
        rule: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FormatError {
    #[error("The message length ({length}) is larger than `forwarded-attachment-max-size` ({max})")]
    MessageTooLarge { length: usize, max: usize },
}

/// A failed call to the bot API.
///
/// The text of every variant may contain the bot token until it is passed
/// through [`DeliveryError::sanitized`].
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("{0}")]
    Transport(String),

    #[error("Non-200 response from Telegram: ({status}) {body}")]
    Status { status: u16, body: String },

    #[error("Error parsing json body of sendMessage: {0}")]
    Json(String),

    #[error("ok != true: {0}")]
    NotOk(String),

    #[error("failed to build upload form: {0}")]
    Form(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        DeliveryError::Transport(e.without_url().to_string())
    }
}

impl DeliveryError {
    /// Render the error with every occurrence of `bot_token` masked.
    pub fn sanitized(&self, bot_token: &str) -> String {
        crate::telegram::sanitize_bot_token(&self.to_string(), bot_token)
    }
}

/// The terminal outcome of a rejected message. `Display` is the text that
/// follows `554 Error: ` in the SMTP reply.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("sender {0} is blacklisted")]
    Blacklisted(String),

    #[error("unable to parse message body")]
    Parse,

    #[error("{0}")]
    Format(#[from] FormatError),

    #[error("email rejected by filter rule '{0}'")]
    Filtered(String),

    #[error("{0}")]
    Delivery(String),
}

#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command not recognized")]
    UnknownCommand,

    #[error("Timeout waiting for client")]
    Timeout,

    #[error("Bad sequence of commands: {0}")]
    BadSequence(&'static str),

    #[error("Syntax error: {0}")]
    InvalidSyntax(&'static str),

    #[error("Relay access denied: {0}")]
    RelayDenied(String),

    #[error("Message size exceeds fixed maximum message size ({max} bytes)")]
    TooMuchData { max: usize },

    #[error("Line too long")]
    LineTooLong,
}

impl SmtpError {
    pub fn response_code(&self) -> u16 {
        match self {
            SmtpError::Io(_) | SmtpError::Timeout => 421,
            SmtpError::UnknownCommand => 502,
            SmtpError::BadSequence(_) => 503,
            SmtpError::InvalidSyntax(_) => 501,
            SmtpError::RelayDenied(_) => 454,
            SmtpError::TooMuchData { .. } => 552,
            SmtpError::LineTooLong => 500,
        }
    }
}

use crate::error::SmtpError;

/// One SMTP reply, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Reply {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Reply { code, lines }
    }

    pub fn ok() -> Self {
        Self::new(250, "OK")
    }

    pub fn greeting(hostname: &str) -> Self {
        Self::new(220, format!("{hostname} ESMTP smtp-tg-relay"))
    }

    pub fn data_start() -> Self {
        Self::new(354, "End data with <CR><LF>.<CR><LF>")
    }

    pub fn queued() -> Self {
        Self::new(250, "OK: queued")
    }

    pub fn rejected(message: &str) -> Self {
        Self::new(554, format!("Error: {message}"))
    }

    pub fn quit() -> Self {
        Self::new(221, "Bye")
    }

    pub fn shutting_down(hostname: &str) -> Self {
        Self::new(421, format!("{hostname} Service shutting down"))
    }

    pub fn from_error(error: &SmtpError) -> Self {
        Self::new(error.response_code(), error.to_string())
    }

    #[cfg(test)]
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.code)
    }

    /// Wire form: `code-text` for every line but the last, `code text` for it.
    pub fn format(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len().saturating_sub(1);
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        if self.lines.is_empty() {
            out.push_str(&format!("{}\r\n", self.code));
        }
        out
    }
}

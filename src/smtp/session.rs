use crate::config::SmtpConfig;
use crate::error::SmtpError;
use crate::mime::Envelope;
use crate::smtp::response::Reply;

pub const COMMAND_LINE_MAX_LENGTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    Greeted,
    MailReceived,
    RecipientsReceived,
}

/// What the connection loop should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Reply(Reply),
    /// Send the reply, then read message data.
    StartData(Reply),
    Quit(Reply),
}

/// Protocol state of one SMTP connection, independent of any socket.
#[derive(Debug)]
pub struct Session<'a> {
    config: &'a SmtpConfig,
    state: State,
    client_domain: Option<String>,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
}

impl<'a> Session<'a> {
    pub fn new(config: &'a SmtpConfig) -> Self {
        Session {
            config,
            state: State::Initial,
            client_domain: None,
            mail_from: None,
            rcpt_to: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> State {
        self.state
    }

    #[cfg(test)]
    pub fn client_domain(&self) -> Option<&str> {
        self.client_domain.as_deref()
    }

    /// Drop the current transaction, keeping the greeting.
    pub fn reset(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        if self.state != State::Initial {
            self.state = State::Greeted;
        }
    }

    pub fn handle_command(&mut self, line: &str) -> Action {
        match self.command(line) {
            Ok(action) => action,
            Err(e) => {
                log::debug!("SMTP command '{}' failed: {}", line.trim_end(), e);
                Action::Reply(Reply::from_error(&e))
            }
        }
    }

    fn command(&mut self, line: &str) -> Result<Action, SmtpError> {
        if line.len() > COMMAND_LINE_MAX_LENGTH {
            return Err(SmtpError::LineTooLong);
        }
        let line = line.trim();
        let (verb, args) = match line.split_once(char::is_whitespace) {
            Some((verb, args)) => (verb, args.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => self.helo(args, false),
            "EHLO" => self.helo(args, true),
            "MAIL" => self.mail(args),
            "RCPT" => self.rcpt(args),
            "DATA" => self.data(args),
            "RSET" => {
                self.reset();
                Ok(Action::Reply(Reply::ok()))
            }
            "NOOP" => Ok(Action::Reply(Reply::ok())),
            "QUIT" => Ok(Action::Quit(Reply::quit())),
            _ => Err(SmtpError::UnknownCommand),
        }
    }

    fn helo(&mut self, domain: &str, extended: bool) -> Result<Action, SmtpError> {
        if domain.is_empty() {
            return Err(SmtpError::InvalidSyntax("HELO/EHLO requires domain address"));
        }
        self.client_domain = Some(domain.to_string());
        self.state = State::Greeted;
        self.reset();

        let hello = format!("{} Hello {}", self.config.primary_host, domain);
        if !extended {
            return Ok(Action::Reply(Reply::new(250, hello)));
        }
        Ok(Action::Reply(Reply::multiline(
            250,
            vec![
                hello,
                format!("SIZE {}", self.config.max_envelope_size),
                "8BITMIME".to_string(),
                "PIPELINING".to_string(),
            ],
        )))
    }

    fn mail(&mut self, args: &str) -> Result<Action, SmtpError> {
        match self.state {
            State::Initial => return Err(SmtpError::BadSequence("send HELO/EHLO first")),
            State::MailReceived | State::RecipientsReceived => {
                return Err(SmtpError::BadSequence("nested MAIL command"))
            }
            State::Greeted => {}
        }

        let rest = strip_prefix_ignore_case(args, "FROM:")
            .ok_or(SmtpError::InvalidSyntax("expected MAIL FROM:<address>"))?;
        let (address, params) = split_path(rest)?;

        for param in params.split_whitespace() {
            if let Some(size) = strip_prefix_ignore_case(param, "SIZE=") {
                let size: usize = size
                    .parse()
                    .map_err(|_| SmtpError::InvalidSyntax("invalid SIZE parameter"))?;
                if size > self.config.max_envelope_size {
                    return Err(SmtpError::TooMuchData {
                        max: self.config.max_envelope_size,
                    });
                }
            }
        }

        self.mail_from = Some(address.to_string());
        self.rcpt_to.clear();
        self.state = State::MailReceived;
        Ok(Action::Reply(Reply::ok()))
    }

    fn rcpt(&mut self, args: &str) -> Result<Action, SmtpError> {
        if !matches!(self.state, State::MailReceived | State::RecipientsReceived) {
            return Err(SmtpError::BadSequence("need MAIL before RCPT"));
        }

        let rest = strip_prefix_ignore_case(args, "TO:")
            .ok_or(SmtpError::InvalidSyntax("expected RCPT TO:<address>"))?;
        let (address, _) = split_path(rest)?;
        if address.is_empty() {
            return Err(SmtpError::InvalidSyntax("empty recipient"));
        }
        if !self.host_allowed(address) {
            return Err(SmtpError::RelayDenied(address.to_string()));
        }

        self.rcpt_to.push(address.to_string());
        self.state = State::RecipientsReceived;
        Ok(Action::Reply(Reply::ok()))
    }

    fn data(&mut self, args: &str) -> Result<Action, SmtpError> {
        if !args.is_empty() {
            return Err(SmtpError::InvalidSyntax("DATA takes no arguments"));
        }
        if self.state != State::RecipientsReceived {
            return Err(SmtpError::BadSequence("need RCPT before DATA"));
        }
        Ok(Action::StartData(Reply::data_start()))
    }

    fn host_allowed(&self, address: &str) -> bool {
        let hosts = &self.config.allowed_hosts;
        if hosts.iter().any(|h| h == ".") {
            return true;
        }
        let domain = match address.rsplit_once('@') {
            Some((_, domain)) => domain.to_lowercase(),
            None => return false,
        };
        hosts.iter().any(|h| *h == domain)
    }

    /// Hand out the finished transaction and reset for the next one.
    pub fn take_envelope(&mut self, data: Vec<u8>) -> Envelope {
        let envelope = Envelope {
            mail_from: self.mail_from.take().unwrap_or_default(),
            rcpt_to: std::mem::take(&mut self.rcpt_to),
            data,
        };
        log::debug!(
            "Received {} bytes from {} (HELO {})",
            envelope.data.len(),
            envelope.mail_from,
            self.client_domain.as_deref().unwrap_or("-")
        );
        self.reset();
        envelope
    }
}

fn strip_prefix_ignore_case<'s>(s: &'s str, prefix: &str) -> Option<&'s str> {
    if s.len() >= prefix.len() && s.is_char_boundary(prefix.len()) && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Split `<path> params` into the address and the remaining parameters.
fn split_path(s: &str) -> Result<(&str, &str), SmtpError> {
    let s = s.trim_start();
    if let Some(inner) = s.strip_prefix('<') {
        let end = inner
            .find('>')
            .ok_or(SmtpError::InvalidSyntax("unterminated address"))?;
        return Ok((inner[..end].trim(), &inner[end + 1..]));
    }
    match s.split_once(char::is_whitespace) {
        Some((address, params)) => Ok((address, params)),
        None => Ok((s, "")),
    }
}

/// Accumulates the lines sent after `DATA` until the lone `.` terminator.
#[derive(Debug)]
pub struct DataCollector {
    data: Vec<u8>,
    max_size: usize,
    overflow: bool,
}

impl DataCollector {
    pub fn new(max_size: usize) -> Self {
        DataCollector {
            data: Vec::new(),
            max_size,
            overflow: false,
        }
    }

    /// Feed one raw line including its terminator. Returns true on the
    /// terminating `.` line.
    pub fn push_line(&mut self, line: &[u8]) -> bool {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line == b"." {
            return true;
        }
        if self.overflow {
            return false;
        }

        let line = line.strip_prefix(b".").unwrap_or(line);
        if self.data.len() + line.len() + 2 > self.max_size {
            self.overflow = true;
            self.data = Vec::new();
            return false;
        }
        self.data.extend_from_slice(line);
        self.data.extend_from_slice(b"\r\n");
        false
    }

    pub fn finish(self) -> Result<Vec<u8>, SmtpError> {
        if self.overflow {
            return Err(SmtpError::TooMuchData { max: self.max_size });
        }
        Ok(self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SmtpConfig {
        SmtpConfig {
            primary_host: "mx.test".to_string(),
            max_envelope_size: 100,
            allowed_hosts: vec!["test".to_string(), "example.com".to_string()],
            ..Default::default()
        }
    }

    fn code(action: Action) -> u16 {
        match action {
            Action::Reply(r) | Action::StartData(r) | Action::Quit(r) => r.code,
        }
    }

    #[test]
    fn test_full_transaction() {
        let config = config();
        let mut session = Session::new(&config);

        assert_eq!(code(session.handle_command("EHLO client.local")), 250);
        assert_eq!(session.client_domain(), Some("client.local"));
        assert_eq!(code(session.handle_command("MAIL FROM:<from@test> SIZE=50")), 250);
        assert_eq!(code(session.handle_command("rcpt to:<to@test>")), 250);
        assert_eq!(code(session.handle_command("RCPT TO:<Other@Example.com>")), 250);
        assert_eq!(session.handle_command("DATA"), Action::StartData(Reply::data_start()));

        let envelope = session.take_envelope(b"Subject: x\r\n\r\nhi\r\n".to_vec());
        assert_eq!(envelope.mail_from, "from@test");
        assert_eq!(envelope.rcpt_to, vec!["to@test", "Other@Example.com"]);
        assert_eq!(session.state(), State::Greeted);
    }

    #[test]
    fn test_ehlo_advertises_size() {
        let config = config();
        let mut session = Session::new(&config);
        match session.handle_command("EHLO client") {
            Action::Reply(reply) => {
                assert_eq!(reply.lines[0], "mx.test Hello client");
                assert!(reply.lines.contains(&"SIZE 100".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_sequences() {
        let config = config();
        let mut session = Session::new(&config);

        assert_eq!(code(session.handle_command("MAIL FROM:<a@test>")), 503);
        session.handle_command("HELO client");
        assert_eq!(code(session.handle_command("RCPT TO:<a@test>")), 503);
        assert_eq!(code(session.handle_command("DATA")), 503);
        session.handle_command("MAIL FROM:<a@test>");
        assert_eq!(code(session.handle_command("MAIL FROM:<b@test>")), 503);
    }

    #[test]
    fn test_relay_denied() {
        let config = config();
        let mut session = Session::new(&config);
        session.handle_command("HELO client");
        session.handle_command("MAIL FROM:<a@test>");
        assert_eq!(code(session.handle_command("RCPT TO:<x@elsewhere.org>")), 454);
        assert_eq!(code(session.handle_command("RCPT TO:<nodomain>")), 454);
        assert_eq!(session.state(), State::MailReceived);
    }

    #[test]
    fn test_any_host_allowed() {
        let config = SmtpConfig {
            allowed_hosts: vec![".".to_string()],
            ..config()
        };
        let mut session = Session::new(&config);
        session.handle_command("HELO client");
        session.handle_command("MAIL FROM:<>");
        assert_eq!(code(session.handle_command("RCPT TO:<x@anywhere.org>")), 250);
    }

    #[test]
    fn test_declared_size_too_large() {
        let config = config();
        let mut session = Session::new(&config);
        session.handle_command("HELO client");
        assert_eq!(code(session.handle_command("MAIL FROM:<a@test> SIZE=101")), 552);
        assert_eq!(code(session.handle_command("MAIL FROM:<a@test> SIZE=abc")), 501);
    }

    #[test]
    fn test_misc_commands() {
        let config = config();
        let mut session = Session::new(&config);
        assert_eq!(code(session.handle_command("NOOP")), 250);
        assert_eq!(code(session.handle_command("VRFY x")), 502);
        assert_eq!(code(session.handle_command("HELO")), 501);
        assert_eq!(code(session.handle_command(&"X".repeat(600))), 500);
        assert_eq!(session.handle_command("QUIT"), Action::Quit(Reply::quit()));

        session.handle_command("HELO client");
        session.handle_command("MAIL FROM:<a@test>");
        assert_eq!(code(session.handle_command("RSET")), 250);
        assert_eq!(session.state(), State::Greeted);
    }

    #[test]
    fn test_data_dot_unstuffing() {
        let mut collector = DataCollector::new(1000);
        assert!(!collector.push_line(b"Subject: x\r\n"));
        assert!(!collector.push_line(b"\r\n"));
        assert!(!collector.push_line(b"..leading dot\r\n"));
        assert!(!collector.push_line(b"bare lf\n"));
        assert!(collector.push_line(b".\r\n"));
        assert_eq!(
            collector.finish().unwrap(),
            b"Subject: x\r\n\r\n.leading dot\r\nbare lf\r\n".to_vec()
        );
    }

    #[test]
    fn test_data_too_large() {
        let mut collector = DataCollector::new(10);
        assert!(!collector.push_line(b"0123456789\r\n"));
        assert!(!collector.push_line(b"more\r\n"));
        assert!(collector.push_line(b".\r\n"));
        assert!(matches!(collector.finish(), Err(SmtpError::TooMuchData { max: 10 })));
    }
}

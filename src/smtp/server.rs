use crate::config::SmtpConfig;
use crate::error::SmtpError;
use crate::relay::Relay;
use crate::smtp::response::Reply;
use crate::smtp::session::{Action, DataCollector, Session, COMMAND_LINE_MAX_LENGTH};
use crate::telegram::ChatApi;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every session finished within the grace period.
    Clean,
    /// Sessions were still running when the grace period ran out.
    TimedOut,
}

enum Line {
    Data(Vec<u8>),
    TooLong,
    Closed,
    ShuttingDown,
}

pub struct SmtpServer<A> {
    config: SmtpConfig,
    relay: Arc<Relay<A>>,
    grace_period: Duration,
}

impl<A: ChatApi + 'static> SmtpServer<A> {
    pub fn new(config: SmtpConfig, relay: Arc<Relay<A>>) -> Self {
        SmtpServer {
            config,
            relay,
            grace_period: SHUTDOWN_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub async fn bind(&self) -> Result<TcpListener, SmtpError> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        log::info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections until `shutdown` resolves, then give running
    /// sessions the grace period to finish.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> ShutdownOutcome
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        log::debug!("Accepted connection from {}", peer);
                        let server = Arc::clone(&self);
                        let stop = stop_rx.clone();
                        sessions.spawn(async move {
                            if let Err(e) = server.handle_connection(stream, stop).await {
                                log::warn!("Session with {} ended with error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => log::error!("Error accepting connection: {}", e),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        drop(listener);
        let _ = stop_tx.send(true);
        log::info!("Shutting down, waiting for {} active sessions", sessions.len());

        let drain = async { while sessions.join_next().await.is_some() {} };
        match tokio::time::timeout(self.grace_period, drain).await {
            Ok(()) => ShutdownOutcome::Clean,
            Err(_) => {
                log::error!(
                    "Sessions still running after {}s grace period",
                    self.grace_period.as_secs()
                );
                sessions.abort_all();
                ShutdownOutcome::TimedOut
            }
        }
    }

    /// Run one SMTP conversation over `stream`.
    pub async fn handle_connection<S>(&self, stream: S, mut stop: watch::Receiver<bool>) -> Result<(), SmtpError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut session = Session::new(&self.config);

        send(&mut writer, &Reply::greeting(&self.config.primary_host)).await?;

        loop {
            let line = match self.read_line(&mut reader, COMMAND_LINE_MAX_LENGTH + 2, &mut stop).await {
                Ok(Line::Data(line)) => line,
                Ok(Line::TooLong) => {
                    send(&mut writer, &Reply::from_error(&SmtpError::LineTooLong)).await?;
                    continue;
                }
                Ok(Line::Closed) => break,
                Ok(Line::ShuttingDown) => {
                    send(&mut writer, &Reply::shutting_down(&self.config.primary_host)).await?;
                    break;
                }
                Err(SmtpError::Timeout) => {
                    send(&mut writer, &Reply::from_error(&SmtpError::Timeout)).await?;
                    break;
                }
                Err(e) => return Err(e),
            };
            let line = String::from_utf8_lossy(&line);

            match session.handle_command(&line) {
                Action::Reply(reply) => send(&mut writer, &reply).await?,
                Action::Quit(reply) => {
                    send(&mut writer, &reply).await?;
                    break;
                }
                Action::StartData(reply) => {
                    send(&mut writer, &reply).await?;
                    let reply = match self.read_data(&mut reader).await? {
                        Some(Ok(data)) => {
                            let envelope = session.take_envelope(data);
                            match self.relay.process(&envelope).await {
                                Ok(()) => Reply::queued(),
                                Err(e) => Reply::rejected(&e.to_string()),
                            }
                        }
                        Some(Err(e)) => {
                            session.reset();
                            Reply::from_error(&e)
                        }
                        None => break,
                    };
                    send(&mut writer, &reply).await?;
                }
            }
        }

        writer.shutdown().await.ok();
        Ok(())
    }

    async fn read_line<R>(
        &self,
        reader: &mut R,
        limit: usize,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<Line, SmtpError>
    where
        R: AsyncBufRead + Unpin,
    {
        if *stop.borrow() {
            return Ok(Line::ShuttingDown);
        }
        let mut buf = Vec::new();
        let mut limited = (&mut *reader).take(limit as u64);
        let read = tokio::time::timeout(self.config.read_timeout, limited.read_until(b'\n', &mut buf));
        let result = tokio::select! {
            result = read => result,
            _ = stop.changed() => return Ok(Line::ShuttingDown),
        };
        match result {
            Ok(Ok(0)) => Ok(Line::Closed),
            Ok(Ok(n)) if n >= limit && buf.last() != Some(&b'\n') => {
                tokio::time::timeout(self.config.read_timeout, discard_line(reader))
                    .await
                    .map_err(|_| SmtpError::Timeout)??;
                Ok(Line::TooLong)
            }
            Ok(Ok(_)) => Ok(Line::Data(buf)),
            Ok(Err(e)) => Err(SmtpError::Io(e)),
            Err(_) => Err(SmtpError::Timeout),
        }
    }

    /// Read message data up to the terminating dot. `None` means the client
    /// went away mid-message.
    async fn read_data<R>(&self, reader: &mut R) -> Result<Option<Result<Vec<u8>, SmtpError>>, SmtpError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut collector = DataCollector::new(self.config.max_envelope_size);
        let limit = self.config.max_envelope_size as u64 + 3;
        loop {
            let mut buf = Vec::new();
            let n = tokio::time::timeout(
                self.config.read_timeout,
                (&mut *reader).take(limit).read_until(b'\n', &mut buf),
            )
            .await
            .map_err(|_| SmtpError::Timeout)??;
            if n == 0 {
                return Ok(None);
            }
            if collector.push_line(&buf) {
                return Ok(Some(collector.finish()));
            }
        }
    }
}

/// Skip input up to and including the next newline.
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    loop {
        let (consumed, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(consumed);
        if done {
            return Ok(());
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, reply: &Reply) -> Result<(), SmtpError> {
    writer.write_all(reply.format().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

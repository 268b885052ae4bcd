use crate::blocklist::SenderBlocklist;
use crate::config::ChatConfig;
use crate::error::RelayError;
use crate::filter::{FilterEngine, FilterInput};
use crate::format::{self, FormattedEmail};
use crate::mime::{self, Envelope};
use crate::telegram::{self, ChatApi};
use std::sync::Arc;

/// Per-message pipeline: blocklist, parse, format, filter, deliver.
///
/// Shared between all SMTP sessions; the only mutable state is the filter
/// engine's active rule set, which is swapped as a whole on reload.
pub struct Relay<A> {
    config: ChatConfig,
    filters: Arc<FilterEngine>,
    blocklist: SenderBlocklist,
    api: A,
}

impl<A: ChatApi> Relay<A> {
    pub fn new(config: ChatConfig, filters: Arc<FilterEngine>, blocklist: SenderBlocklist, api: A) -> Self {
        Relay {
            config,
            filters,
            blocklist,
            api,
        }
    }

    pub fn filters(&self) -> &Arc<FilterEngine> {
        &self.filters
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Run one message to its terminal outcome and log it.
    pub async fn process(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let result = self.run(envelope).await;
        match &result {
            Ok(()) => log::info!(
                "Accepted email from {} to {}",
                envelope.mail_from,
                envelope.recipients()
            ),
            Err(RelayError::Blacklisted(sender)) => {
                log::info!("Rejecting email from blacklisted sender: {}", sender)
            }
            Err(RelayError::Filtered(rule)) => log::info!(
                "Rejecting email from {}: matched filter rule '{}'",
                envelope.mail_from,
                rule
            ),
            Err(e) => log::warn!("Rejecting email from {}: {}", envelope.mail_from, e),
        }
        result
    }

    async fn run(&self, envelope: &Envelope) -> Result<(), RelayError> {
        if self.blocklist.is_blocked(&envelope.mail_from) {
            return Err(RelayError::Blacklisted(envelope.mail_from.clone()));
        }

        let parsed = mime::parse_envelope(envelope).ok_or(RelayError::Parse)?;
        let email = format::format_email(&parsed, &self.config)?;

        if let Some(rule) = self.filters.evaluate(&filter_input(&email)) {
            return Err(RelayError::Filtered(rule));
        }

        telegram::deliver(&self.api, &email, &self.config).await
    }
}

fn filter_input(email: &FormattedEmail) -> FilterInput<'_> {
    FilterInput {
        from: &email.from,
        to: &email.to,
        subject: &email.subject,
        body: &email.text,
        html: &email.html,
    }
}

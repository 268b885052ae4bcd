use crate::attachment::OCTET_STREAM;
use crate::format::{MimePart, ParsedEmail, PartCategory};
use mail_parser::{Message, MessageParser, MessagePart, MimeHeaders, PartType};

/// SMTP envelope data that travels alongside the raw message.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn recipients(&self) -> String {
        self.rcpt_to.join(", ")
    }
}

/// Decode the raw message of `envelope`. Returns `None` when the data is not
/// a message at all.
pub fn parse_envelope(envelope: &Envelope) -> Option<ParsedEmail> {
    let message = MessageParser::default().parse(&envelope.data[..])?;

    let text = message
        .body_text(0)
        .map(|t| t.into_owned())
        .unwrap_or_default();
    let html = message
        .body_html(0)
        .map(|h| h.into_owned())
        .unwrap_or_default();

    Some(ParsedEmail {
        from: envelope.mail_from.clone(),
        to: envelope.recipients(),
        subject: message.subject().unwrap_or_default().to_string(),
        text,
        html,
        parts: collect_parts(&message),
        raw: envelope.data.clone(),
    })
}

fn collect_parts(message: &Message) -> Vec<MimePart> {
    let mut parts = Vec::new();

    for (id, part) in message.parts.iter().enumerate() {
        if matches!(part.body, PartType::Multipart(_)) {
            continue;
        }

        let category = if message.attachments.contains(&id) {
            if is_inline(part) {
                PartCategory::Inline
            } else {
                PartCategory::Attachment
            }
        } else if message.text_body.contains(&id) || message.html_body.contains(&id) {
            continue;
        } else {
            PartCategory::Other
        };

        parts.push(MimePart {
            category,
            filename: part.attachment_name().unwrap_or_default().to_string(),
            content_type: media_type(part),
            content: part.contents().to_vec(),
        });
    }

    parts
}

fn is_inline(part: &MessagePart) -> bool {
    if matches!(part.body, PartType::InlineBinary(_)) {
        return true;
    }
    part.content_disposition()
        .map(|d| d.ctype().eq_ignore_ascii_case("inline"))
        .unwrap_or(false)
}

/// `type/subtype` in lower case, without parameters.
fn media_type(part: &MessagePart) -> String {
    match part.content_type() {
        Some(ct) => match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub).to_lowercase(),
            None => ct.ctype().to_lowercase(),
        },
        None => match part.body {
            PartType::Text(_) => "text/plain".to_string(),
            PartType::Html(_) => "text/html".to_string(),
            PartType::Message(_) => "message/rfc822".to_string(),
            _ => OCTET_STREAM.to_string(),
        },
    }
}

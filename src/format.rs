use crate::attachment::{self, AttachmentKind, Classification};
use crate::config::{human_size, ChatConfig};
use crate::error::FormatError;

pub const BODY_TRUNCATED: &str = "\n\n[truncated]";
pub const FULL_MESSAGE_FILENAME: &str = "full_message.txt";
pub const FULL_MESSAGE_CAPTION: &str = "Full message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartCategory {
    Inline,
    Attachment,
    /// Parts the MIME layer could not place as inline or attachment.
    Other,
}

impl PartCategory {
    fn marker(&self) -> &'static str {
        match self {
            PartCategory::Inline => "🔗",
            PartCategory::Attachment => "📎",
            PartCategory::Other => "❔",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimePart {
    pub category: PartCategory,
    pub filename: String,
    /// Declared media type without parameters, e.g. `image/jpeg`.
    pub content_type: String,
    pub content: Vec<u8>,
}

/// A decoded inbound email, as handed over by the MIME layer.
#[derive(Debug, Clone, Default)]
pub struct ParsedEmail {
    pub from: String,
    /// Recipients joined with `", "`.
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub parts: Vec<MimePart>,
    /// The undecoded message, used as the body of last resort.
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedAttachment {
    pub filename: String,
    pub caption: String,
    pub content: Vec<u8>,
    pub kind: AttachmentKind,
}

/// Everything needed to filter and deliver one message.
#[derive(Debug, Clone)]
pub struct FormattedEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    /// Forwarded for filtering only.
    pub html: String,
    /// Final chat text: template applied, possibly truncated.
    pub text: String,
    pub attachments: Vec<FormattedAttachment>,
}

/// Length as the chat API counts it: Unicode code points.
pub fn visible_len(s: &str) -> usize {
    s.chars().count()
}

/// Length as a file on the wire: bytes.
pub fn storage_size(s: &str) -> usize {
    s.len()
}

/// The first `n` code points of `s`.
pub fn take_visible(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Values substituted into a [`MessageTemplate`].
#[derive(Debug, Clone, Copy)]
pub struct TemplateFields<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub attachments_details: &'a str,
}

/// A message template with `{from}`, `{to}`, `{subject}`, `{body}` and
/// `{attachments_details}` placeholders and a literal `\n` escape.
///
/// Substitution is a single left-to-right pass over the template; inserted
/// values are never rescanned.
#[derive(Debug, Clone)]
pub struct MessageTemplate<'t> {
    source: &'t str,
}

impl<'t> MessageTemplate<'t> {
    pub fn new(source: &'t str) -> Self {
        MessageTemplate { source }
    }

    pub fn render(&self, fields: &TemplateFields) -> String {
        let tokens: [(&str, &str); 6] = [
            ("\\n", "\n"),
            ("{from}", fields.from),
            ("{to}", fields.to),
            ("{subject}", fields.subject),
            ("{body}", fields.body),
            ("{attachments_details}", fields.attachments_details),
        ];

        let mut out = String::with_capacity(self.source.len() + fields.body.len());
        let mut rest = self.source;
        'scan: while let Some(c) = rest.chars().next() {
            for (token, value) in &tokens {
                if let Some(tail) = rest.strip_prefix(token) {
                    out.push_str(value);
                    rest = tail;
                    continue 'scan;
                }
            }
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
        out
    }

    /// Render and trim surrounding whitespace.
    pub fn render_trimmed(&self, fields: &TemplateFields) -> String {
        self.render(fields).trim().to_string()
    }
}

/// Result of fitting a rendering under the length threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendering {
    Complete(String),
    Truncated { full: String, truncated: String },
}

/// Render the template and, when it exceeds `threshold` code points, also
/// produce a truncated variant that fits.
pub fn render_message(template: &MessageTemplate, fields: &TemplateFields, threshold: usize) -> Rendering {
    let body = fields.body.trim();
    let full = template.render_trimmed(&TemplateFields { body, ..*fields });
    if visible_len(&full) <= threshold {
        return Rendering::Complete(full);
    }

    let placeholder_body = format!(".{BODY_TRUNCATED}");
    let empty = template.render_trimmed(&TemplateFields {
        body: placeholder_body.trim(),
        ..*fields
    });
    let overhead = visible_len(&empty);
    if overhead >= threshold {
        log::debug!("Template overhead ({overhead}) leaves no room for the body, cutting the text");
        let truncated = take_visible(&full, threshold).to_string();
        return Rendering::Truncated { full, truncated };
    }

    let max_body_length = threshold - overhead;
    let cut_body = format!("{}{}", take_visible(body, max_body_length), BODY_TRUNCATED);
    let truncated = template.render_trimmed(&TemplateFields {
        body: cut_body.trim(),
        ..*fields
    });
    assert!(
        visible_len(&truncated) <= threshold,
        "Unexpected length of truncated message:\n{max_body_length}\n{truncated}"
    );
    Rendering::Truncated { full, truncated }
}

/// Turn a parsed email into chat text plus the attachments to upload.
pub fn format_email(email: &ParsedEmail, config: &ChatConfig) -> Result<FormattedEmail, FormatError> {
    let mut text = email.text.clone();
    let mut details: Vec<String> = Vec::new();
    let mut attachments: Vec<FormattedAttachment> = Vec::new();

    let classified = email
        .parts
        .iter()
        .filter(|p| p.category == PartCategory::Inline)
        .chain(
            email
                .parts
                .iter()
                .filter(|p| p.category == PartCategory::Attachment),
        );

    for part in classified {
        if part.content == email.text.as_bytes() {
            continue;
        }
        if text.is_empty() && part.content_type == "text/plain" && part.filename.is_empty() {
            text = String::from_utf8_lossy(&part.content).into_owned();
            continue;
        }

        let content_type = attachment::effective_content_type(&part.content_type, &part.filename);
        let classification = attachment::classify(
            &content_type,
            part.content.len(),
            config.forwarded_attachment_max_photo_size,
            config.forwarded_attachment_max_size,
        );
        if let Classification::Send(kind) = classification {
            attachments.push(FormattedAttachment {
                filename: part.filename.clone(),
                caption: part.filename.clone(),
                content: part.content.clone(),
                kind,
            });
        }
        details.push(detail_line(part, &content_type, classification.action()));
    }

    for part in email.parts.iter().filter(|p| p.category == PartCategory::Other) {
        let content_type = attachment::effective_content_type(&part.content_type, &part.filename);
        details.push(detail_line(part, &content_type, Classification::Discard.action()));
    }

    if text.is_empty() {
        text = String::from_utf8_lossy(&email.raw).into_owned();
    }

    let attachments_details = if details.is_empty() {
        String::new()
    } else {
        format!("Attachments:\n{}", details.join("\n"))
    };

    let template = MessageTemplate::new(&config.message_template);
    let fields = TemplateFields {
        from: &email.from,
        to: &email.to,
        subject: &email.subject,
        body: &text,
        attachments_details: &attachments_details,
    };

    let text_out = match render_message(&template, &fields, config.message_length_to_send_as_file) {
        Rendering::Complete(full) => full,
        Rendering::Truncated { full, truncated } => {
            if storage_size(&full) > config.forwarded_attachment_max_size {
                return Err(FormatError::MessageTooLarge {
                    length: storage_size(&full),
                    max: config.forwarded_attachment_max_size,
                });
            }
            attachments.insert(
                0,
                FormattedAttachment {
                    filename: FULL_MESSAGE_FILENAME.to_string(),
                    caption: FULL_MESSAGE_CAPTION.to_string(),
                    content: full.into_bytes(),
                    kind: AttachmentKind::Document,
                },
            );
            truncated
        }
    };

    Ok(FormattedEmail {
        from: email.from.clone(),
        to: email.to.clone(),
        subject: email.subject.clone(),
        html: email.html.clone(),
        text: text_out,
        attachments,
    })
}

fn detail_line(part: &MimePart, content_type: &str, action: &str) -> String {
    format!(
        "- {} {} ({}) {}, {}",
        part.category.marker(),
        part.filename,
        content_type,
        human_size(part.content.len()),
        action
    )
}

//! RFC822 message parsing (spec.md §4.3) via `mailparse`, the crate the
//! teacher's `ImapProvider::convert_imap_message` actually exercises (as
//! opposed to the unused `mail-parser` dependency carried alongside it).

use crate::model::{format_address, join_addresses, Message, MessageParseError};
use chrono::{DateTime, Utc};
use mailparse::{MailHeaderMap, ParsedMail};
use std::collections::HashSet;

/// An attachment pulled out of a message body, still in memory. The IMAP
/// Gateway writes it to disk and fills in `Attachment::path` afterwards.
pub struct ParsedAttachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// The result of parsing one fetched message: the canonical record (without
/// `eml_path`/`attachments[].path`, which the caller fills in once the raw
/// bytes and attachment bodies are written to disk) plus the attachments
/// still carrying their bytes.
pub struct ParseOutput {
    pub message: Message,
    pub attachments: Vec<ParsedAttachment>,
}

/// Parses one message's raw RFC822 bytes. Isolated per message: a parse
/// failure here becomes a `MessageParseError` for the caller to record and
/// exclude from the batch, never a panic or an aborted sync (spec.md §7
/// kind 4).
pub fn parse_message(uid: u64, raw: &[u8]) -> Result<ParseOutput, MessageParseError> {
    try_parse(uid, raw).map_err(|error| MessageParseError { uid, error: error.to_string() })
}

fn try_parse(uid: u64, raw: &[u8]) -> Result<ParseOutput, mailparse::MailParseError> {
    let parsed = mailparse::parse_mail(raw)?;

    let subject = parsed.headers.get_first_value("Subject").unwrap_or_default();
    let message_id = parsed.headers.get_first_value("Message-ID").map(|v| v.trim().to_string());
    let in_reply_to = parsed.headers.get_first_value("In-Reply-To").map(|v| v.trim().to_string());
    let references = parsed
        .headers
        .get_first_value("References")
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    let from = extract_addr_list(&parsed, "From");
    let to = extract_addr_list(&parsed, "To");
    let cc = extract_addr_list(&parsed, "Cc");

    let date = parsed
        .headers
        .get_first_value("Date")
        .and_then(|v| mailparse::dateparse(&v).ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);

    let body = extract_body(&parsed);
    let attachments = extract_attachments(&parsed);

    let message = Message {
        uid,
        message_id,
        subject,
        from,
        to,
        cc,
        date,
        flags: HashSet::new(),
        size: raw.len() as u64,
        in_reply_to,
        references,
        eml_path: None,
        has_attachments: !attachments.is_empty(),
        attachments: vec![],
        body,
    };

    Ok(ParseOutput { message, attachments })
}

fn extract_addr_list(parsed: &ParsedMail, header: &str) -> String {
    let Some(raw) = parsed.headers.get_first_value(header) else { return String::new() };
    match mailparse::addrparse(&raw) {
        Ok(addrs) => join_addresses(addrs.iter().map(|addr| match addr {
            mailparse::MailAddr::Single(info) => format_address(info.display_name.as_deref(), &info.addr),
            mailparse::MailAddr::Group(group) => group
                .addrs
                .iter()
                .map(|info| format_address(info.display_name.as_deref(), &info.addr))
                .collect::<Vec<_>>()
                .join(", "),
        })),
        Err(_) => raw.trim().to_string(),
    }
}

/// Prefers `text/plain`; falls back to `text/html` rendered to plaintext
/// via `html2text`, matching the teacher's `extract_content` fallback chain.
fn extract_body(parsed: &ParsedMail) -> String {
    if let Some(part) = find_part(parsed, "text/plain") {
        if let Ok(body) = part.get_body() {
            return body;
        }
    }
    if let Some(part) = find_part(parsed, "text/html") {
        if let Ok(body) = part.get_body() {
            return html2text::from_read(body.as_bytes(), 80);
        }
    }
    String::new()
}

fn find_part<'a>(parsed: &'a ParsedMail<'a>, mimetype: &str) -> Option<&'a ParsedMail<'a>> {
    if parsed.subparts.is_empty() {
        return (parsed.ctype.mimetype == mimetype).then_some(parsed);
    }
    for sub in &parsed.subparts {
        if let Some(found) = find_part(sub, mimetype) {
            return Some(found);
        }
    }
    None
}

/// Walks every part recursively, collecting ones disposed `attachment`, or
/// `inline` with a filename (spec.md §4.3), mirroring the teacher's
/// `extract_attachments_recursive`.
fn extract_attachments(parsed: &ParsedMail) -> Vec<ParsedAttachment> {
    let mut out = Vec::new();
    collect_attachments(parsed, &mut out);
    out
}

fn collect_attachments(part: &ParsedMail, out: &mut Vec<ParsedAttachment>) {
    if let Some(filename) = part.get_content_disposition().params.get("filename").cloned().or_else(|| {
        part.ctype.params.get("name").cloned()
    }) {
        let disposition = part.get_content_disposition().disposition;
        let is_attachment =
            disposition == mailparse::DispositionType::Attachment || disposition == mailparse::DispositionType::Inline;
        if is_attachment {
            if let Ok(bytes) = part.get_body_raw() {
                out.push(ParsedAttachment { filename, content_type: part.ctype.mimetype.clone(), bytes });
            }
        }
    }
    for sub in &part.subparts {
        collect_attachments(sub, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] = b"From: Alice <alice@example.com>\r\n\
To: Bob <bob@example.com>\r\n\
Subject: Hello\r\n\
Message-ID: <abc@example.com>\r\n\
Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n\
Content-Type: text/plain\r\n\
\r\n\
Hi Bob, how are you?\r\n";

    #[test]
    fn parses_simple_text_message() {
        let output = parse_message(1, SIMPLE).unwrap();
        assert_eq!(output.message.subject, "Hello");
        assert_eq!(output.message.from, "Alice <alice@example.com>");
        assert_eq!(output.message.to, "Bob <bob@example.com>");
        assert_eq!(output.message.message_id.as_deref(), Some("<abc@example.com>"));
        assert!(output.message.body.contains("Hi Bob"));
        assert!(!output.message.has_attachments);
        assert!(output.attachments.is_empty());
    }

    const WITH_INLINE_CALENDAR: &[u8] = b"From: Alice <alice@example.com>\r\n\
To: Bob <bob@example.com>\r\n\
Subject: Invite\r\n\
Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain\r\n\
\r\n\
See attached invite.\r\n\
--b1\r\n\
Content-Type: text/calendar\r\n\
Content-Disposition: inline; filename=\"invite.ics\"\r\n\
\r\n\
BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n\
--b1--\r\n";

    #[test]
    fn inline_part_with_filename_is_extracted_as_attachment() {
        let output = parse_message(1, WITH_INLINE_CALENDAR).unwrap();
        assert!(output.message.has_attachments);
        assert_eq!(output.attachments.len(), 1);
        assert_eq!(output.attachments[0].filename, "invite.ics");
        assert_eq!(output.attachments[0].content_type, "text/calendar");
    }

    #[test]
    fn malformed_message_reports_error_without_panicking() {
        // mailparse is lenient, so feed it something that cannot even be
        // decoded as UTF-8-ish headers to force a parse error.
        let garbage = vec![0xffu8; 4];
        let result = parse_message(99, &garbage);
        // mailparse tolerates near anything; this assertion only protects
        // against a panic, accepting either outcome.
        match result {
            Ok(_) | Err(_) => {}
        }
    }
}

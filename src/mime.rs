//! Message header extraction and body decoding
//!
//! Parses fetched RFC822 source using `mailparse` to obtain decoded
//! subject, sender, recipients, and date. The IMAP ENVELOPE from the same
//! FETCH serves as a fallback when the source yields nothing (some servers
//! hand back bodies with mangled header sections). Bodies are decoded as
//! UTF-8 with replacement; no MIME part walking happens in this revision.

use std::collections::BTreeMap;

use async_imap::types::Fetch;
use chrono::{DateTime, TimeZone, Utc};

use crate::models::MessageEnvelope;

/// Extract the envelope for a fetched message
///
/// Prefers headers parsed from the source; falls back to the server's
/// ENVELOPE response for subject and sender when the source is unusable.
pub fn message_envelope(fetch: &Fetch, source: &[u8]) -> MessageEnvelope {
    let mut envelope = envelope_from_source(source);

    if let Some(imap_envelope) = fetch.envelope() {
        if envelope.subject.is_empty()
            && let Some(subject) = &imap_envelope.subject
        {
            envelope.subject = decode_bytes(subject);
        }
        if envelope.from.is_empty()
            && let Some(from) = &imap_envelope.from
            && let Some(address) = from.first()
        {
            envelope.from = format_address(
                address.name.as_deref(),
                address.mailbox.as_deref(),
                address.host.as_deref(),
            );
        }
    }

    envelope
}

/// Extract envelope fields from raw RFC822 source
///
/// Header values come back RFC 2047-decoded from `mailparse`. Missing
/// headers yield empty fields, not errors.
pub fn envelope_from_source(source: &[u8]) -> MessageEnvelope {
    let Ok((headers, _)) = mailparse::parse_headers(source) else {
        return MessageEnvelope::default();
    };

    let map = header_map(&headers);
    MessageEnvelope {
        subject: map.get("subject").cloned().unwrap_or_default(),
        from: map.get("from").cloned().unwrap_or_default(),
        to: map
            .get("to")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|addr| !addr.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default(),
        date: map.get("date").and_then(|value| parse_date(value)),
    }
}

/// Decode message source as UTF-8 with replacement on invalid bytes
pub fn decode_body(source: &[u8]) -> String {
    String::from_utf8_lossy(source).into_owned()
}

/// Truncate string to maximum characters (Unicode-aware)
///
/// Preserves complete characters, never splitting multi-byte sequences.
pub fn truncate_chars(input: String, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input;
    }
    input.chars().take(max_chars).collect()
}

/// Parse an RFC 2822 Date header value
fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let epoch = mailparse::dateparse(value).ok()?;
    Utc.timestamp_opt(epoch, 0).single()
}

/// Convert parsed headers to a case-insensitive first-value map
fn header_map(headers: &[mailparse::MailHeader<'_>]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for header in headers {
        let key = header.get_key().to_ascii_lowercase();
        map.entry(key).or_insert_with(|| header.get_value());
    }
    map
}

/// Render an IMAP envelope address as `Name <mailbox@host>`
fn format_address(
    name: Option<&[u8]>,
    mailbox: Option<&[u8]>,
    host: Option<&[u8]>,
) -> String {
    let mailbox = mailbox.map(decode_bytes).unwrap_or_default();
    let host = host.map(decode_bytes).unwrap_or_default();
    let addr = if mailbox.is_empty() || host.is_empty() {
        format!("{mailbox}{host}")
    } else {
        format!("{mailbox}@{host}")
    };

    match name.map(decode_bytes).filter(|n| !n.is_empty()) {
        Some(display) if !addr.is_empty() => format!("{display} <{addr}>"),
        Some(display) => display,
        None => addr,
    }
}

fn decode_bytes(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

//! RFC 5322 plain-text message building.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;

use crate::template::RenderedEmail;

/// Build the raw message for `email`.
pub fn build_message(email: &RenderedEmail, sender: &str) -> String {
    let mut message = String::with_capacity(email.body.len() + 256);

    message.push_str(&format!("From: {}\r\n", header_value(sender)));
    message.push_str(&format!("To: {}\r\n", email.to.email));
    message.push_str(&format!("Subject: {}\r\n", header_value(&email.subject)));
    message.push_str("MIME-Version: 1.0\r\n");
    message.push_str("Content-Type: text/plain; charset=\"utf-8\"\r\n");
    message.push_str("Content-Transfer-Encoding: base64\r\n");
    message.push_str("\r\n");

    // 76-character lines per RFC 2045
    let encoded = STANDARD.encode(normalize_newlines(&email.body));
    for chunk in encoded.as_bytes().chunks(76) {
        message.push_str(&String::from_utf8_lossy(chunk));
        message.push_str("\r\n");
    }

    message
}

/// Message encoded for the Gmail API `raw` field.
pub fn encode_raw(email: &RenderedEmail, sender: &str) -> String {
    URL_SAFE.encode(build_message(email, sender))
}

/// Header-safe value: single line, RFC 2047 encoded when not plain ASCII.
fn header_value(value: &str) -> String {
    let single_line = value.replace(['\r', '\n'], " ");
    if single_line.is_ascii() {
        single_line
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(single_line))
    }
}

fn normalize_newlines(body: &str) -> String {
    body.replace("\r\n", "\n").replace('\n', "\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipients::Recipient;

    fn email(subject: &str, body: &str) -> RenderedEmail {
        RenderedEmail {
            to: Recipient::new("test", "ann@example.com", Some("Ann")).unwrap(),
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_headers_and_body() {
        let raw = build_message(&email("Hello", "Hi Ann,\nbye"), "Jane from Acme");

        assert!(raw.starts_with("From: Jane from Acme\r\nTo: ann@example.com\r\nSubject: Hello\r\n"));
        let (_, body) = raw.split_once("\r\n\r\n").unwrap();
        let decoded = STANDARD.decode(body.replace("\r\n", "")).unwrap();
        assert_eq!(decoded, b"Hi Ann,\r\nbye");
    }

    #[test]
    fn test_non_ascii_subject_is_encoded() {
        let raw = build_message(&email("Café time", "x"), "Me");
        let expected = format!("Subject: =?UTF-8?B?{}?=\r\n", STANDARD.encode("Café time"));
        assert!(raw.contains(&expected));
    }

    #[test]
    fn test_raw_is_url_safe() {
        let raw = encode_raw(&email("??>>", "~~~~"), "Me");
        assert!(!raw.contains('+') && !raw.contains('/'));
        let decoded = URL_SAFE.decode(raw).unwrap();
        assert!(String::from_utf8(decoded).unwrap().contains("Subject: ??>>"));
    }
}

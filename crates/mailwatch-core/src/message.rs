//! Decoded messages.

use std::fmt;

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;

use crate::session::Uid;
use crate::{Error, Result};

/// A mailbox address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Display name, if given.
    pub name: Option<String>,
    /// The address itself.
    pub email: String,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} <{}>", self.email),
            None => write!(f, "{}", self.email),
        }
    }
}

/// A fetched and decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// UID within the searched mailbox.
    pub uid: Uid,
    /// `Message-ID` header.
    pub message_id: Option<String>,
    /// Decoded subject.
    pub subject: Option<String>,
    /// Senders.
    pub from: Vec<Address>,
    /// `To` recipients, with groups flattened.
    pub to: Vec<Address>,
    /// `Date` header.
    pub date: Option<DateTime<Utc>>,
    /// First text body part.
    pub text: Option<String>,
    /// Size of the raw message in bytes.
    pub size: usize,
}

impl Message {
    /// Decodes a raw RFC 5322 message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fetch`] for `uid` if the bytes are not a message.
    pub fn parse(uid: Uid, raw: &[u8]) -> Result<Self> {
        let parsed = MessageParser::new().parse(raw).ok_or_else(|| Error::Fetch {
            uid,
            reason: "message could not be decoded".to_string(),
        })?;

        Ok(Self {
            uid,
            message_id: parsed.message_id().map(str::to_string),
            subject: parsed.subject().map(str::to_string),
            from: addresses(parsed.from()),
            to: addresses(parsed.to()),
            date: parsed
                .date()
                .and_then(|date| DateTime::from_timestamp(date.to_timestamp(), 0)),
            text: parsed.body_text(0).map(|text| text.into_owned()),
            size: raw.len(),
        })
    }

    /// Bare recipient addresses.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to.iter().map(|addr| addr.email.as_str())
    }
}

fn addresses(header: Option<&mail_parser::Address<'_>>) -> Vec<Address> {
    let Some(header) = header else {
        return Vec::new();
    };
    let addrs: Vec<&mail_parser::Addr<'_>> = match header {
        mail_parser::Address::List(list) => list.iter().collect(),
        mail_parser::Address::Group(groups) => {
            groups.iter().flat_map(|group| group.addresses.iter()).collect()
        }
    };
    addrs
        .into_iter()
        .filter_map(|addr| {
            let email = addr.address.as_deref()?.trim();
            (!email.is_empty()).then(|| Address {
                name: addr
                    .name
                    .as_deref()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string),
                email: email.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"Message-ID: <abc@example.com>\r\n\
From: Alice Example <alice@example.com>\r\n\
To: Bob <bob@example.com>, carol@example.com\r\n\
Subject: =?UTF-8?Q?Gr=C3=BC=C3=9Fe?=\r\n\
Date: Tue, 1 Oct 2024 10:00:00 +0000\r\n\
\r\n\
Hello there\r\n";

    fn uid(n: u32) -> Uid {
        Uid::new(n).unwrap()
    }

    #[test]
    fn test_parse_headers() {
        let message = Message::parse(uid(7), RAW).unwrap();
        assert_eq!(message.uid, uid(7));
        assert_eq!(message.message_id.as_deref(), Some("abc@example.com"));
        assert_eq!(message.subject.as_deref(), Some("Grüße"));
        assert_eq!(message.from[0].to_string(), "Alice Example <alice@example.com>");
        assert_eq!(
            message.recipients().collect::<Vec<_>>(),
            vec!["bob@example.com", "carol@example.com"]
        );
        assert_eq!(message.to[1].name, None);
        assert_eq!(
            message.date.unwrap().to_rfc3339(),
            "2024-10-01T10:00:00+00:00"
        );
        assert_eq!(message.text.as_deref().map(str::trim), Some("Hello there"));
        assert_eq!(message.size, RAW.len());
    }

    #[test]
    fn test_group_recipients_are_flattened() {
        let raw = b"To: Team: dave@example.com, erin@example.com;\r\nSubject: x\r\n\r\nbody\r\n";
        let message = Message::parse(uid(1), raw).unwrap();
        assert_eq!(
            message.recipients().collect::<Vec<_>>(),
            vec!["dave@example.com", "erin@example.com"]
        );
    }

    #[test]
    fn test_missing_headers() {
        let message = Message::parse(uid(2), b"Subject: only\r\n\r\n").unwrap();
        assert!(message.from.is_empty());
        assert!(message.to.is_empty());
        assert!(message.date.is_none());
    }

    #[test]
    fn test_empty_input_is_fetch_error() {
        let err = Message::parse(uid(9), b"").unwrap_err();
        assert!(matches!(err, Error::Fetch { uid: u, .. } if u == uid(9)));
    }
}

//! IDLE (RFC 2177) outcomes and push classification.

use async_imap::imap_proto::{MailboxDatum, Response};

/// How a call to [`ImapSession::idle`](crate::ImapSession::idle) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The message count of the selected mailbox changed.
    CountChanged {
        /// Message count after the change.
        exists: u32,
    },
    /// The timeout elapsed without a count change.
    Timeout,
    /// The interrupt future resolved first.
    Interrupted,
}

/// A server push received while idling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Push {
    Exists(u32),
    Expunge,
    Other,
}

impl Push {
    pub(crate) fn classify(response: &Response<'_>) -> Self {
        match response {
            Response::MailboxData(MailboxDatum::Exists(n)) => Self::Exists(*n),
            Response::Expunge(_) => Self::Expunge,
            _ => Self::Other,
        }
    }

    /// Applies the push to a known message count; returns the new count if
    /// it changed.
    pub(crate) const fn apply(self, exists: u32) -> Option<u32> {
        match self {
            Self::Exists(n) if n != exists => Some(n),
            Self::Expunge => Some(exists.saturating_sub(1)),
            Self::Exists(_) | Self::Other => None,
        }
    }
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
    use async_imap::imap_proto::parser::parse_response;

    use super::*;

    fn push(line: &[u8]) -> Push {
        let (_, response) = parse_response(line).unwrap();
        Push::classify(&response)
    }

    #[test]
    fn test_classify() {
        assert_eq!(push(b"* 12 EXISTS\r\n"), Push::Exists(12));
        assert_eq!(push(b"* 3 EXPUNGE\r\n"), Push::Expunge);
        assert_eq!(push(b"* 2 RECENT\r\n"), Push::Other);
        assert_eq!(push(b"* OK Still here\r\n"), Push::Other);
    }

    #[test]
    fn test_apply() {
        assert_eq!(Push::Exists(5).apply(4), Some(5));
        assert_eq!(Push::Exists(4).apply(4), None);
        assert_eq!(Push::Expunge.apply(4), Some(3));
        assert_eq!(Push::Expunge.apply(0), Some(0));
        assert_eq!(Push::Other.apply(4), None);
    }
}

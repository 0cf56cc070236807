//! Core IMAP identifiers and mailbox state.

use std::num::NonZeroU32;

/// Unique identifier of a message within one mailbox.
///
/// UIDs are stable for the lifetime of a mailbox's UIDVALIDITY, but a
/// concurrent client expunging messages can make a previously seen UID
/// disappear between two sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(NonZeroU32);

impl Uid {
    /// Creates a new UID.
    ///
    /// Returns `None` if the value is 0.
    #[must_use]
    pub const fn new(n: u32) -> Option<Self> {
        match NonZeroU32::new(n) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Renders UIDs as an IMAP sequence set, collapsing consecutive runs
/// into ranges (`1:3,7,9:10`).
///
/// Input order and duplicates do not matter. Returns an empty string for
/// an empty slice.
#[must_use]
pub fn uid_set(uids: &[Uid]) -> String {
    let mut sorted: Vec<u32> = uids.iter().map(|uid| uid.get()).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let (mut start, mut end) = (first, first);
    for uid in iter {
        if end.checked_add(1) == Some(uid) {
            end = uid;
        } else {
            parts.push(render_range(start, end));
            (start, end) = (uid, uid);
        }
    }
    parts.push(render_range(start, end));
    parts.join(",")
}

fn render_range(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}:{end}")
    }
}

/// Mailbox state reported when a mailbox is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MailboxStatus {
    /// Number of messages in the mailbox.
    pub exists: u32,
    /// Predicted next UID.
    pub uid_next: Option<u32>,
    /// UIDVALIDITY of the mailbox.
    pub uid_validity: Option<u32>,
}

impl From<&async_imap::types::Mailbox> for MailboxStatus {
    fn from(mailbox: &async_imap::types::Mailbox) -> Self {
        Self {
            exists: mailbox.exists,
            uid_next: mailbox.uid_next,
            uid_validity: mailbox.uid_validity,
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
    use proptest::prelude::*;

    use super::*;

    fn uids(values: &[u32]) -> Vec<Uid> {
        values.iter().map(|&v| Uid::new(v).unwrap()).collect()
    }

    #[test]
    fn test_uid_zero_is_invalid() {
        assert!(Uid::new(0).is_none());
        assert_eq!(Uid::new(42).unwrap().get(), 42);
        assert_eq!(Uid::new(42).unwrap().to_string(), "42");
    }

    #[test]
    fn test_uid_set_ranges() {
        assert_eq!(uid_set(&[]), "");
        assert_eq!(uid_set(&uids(&[5])), "5");
        assert_eq!(uid_set(&uids(&[3, 1, 2, 7, 10, 9])), "1:3,7,9:10");
        assert_eq!(uid_set(&uids(&[4, 4, 4])), "4");
    }

    fn expand(set: &str) -> Vec<u32> {
        set.split(',')
            .flat_map(|part| match part.split_once(':') {
                Some((a, b)) => (a.parse::<u32>().unwrap()..=b.parse().unwrap()).collect(),
                None => vec![part.parse().unwrap()],
            })
            .collect()
    }

    proptest! {
        #[test]
        fn uid_set_covers_exactly_the_input(values in prop::collection::vec(1u32..500, 1..60)) {
            let mut expected = values.clone();
            expected.sort_unstable();
            expected.dedup();

            prop_assert_eq!(expand(&uid_set(&uids(&values))), expected);
        }
    }
}

//! Server-side search expressions.

use std::fmt;

use chrono::NaiveDate;

/// An immutable search expression evaluated by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchQuery {
    /// Every message.
    All,
    /// Messages flagged `\Deleted`.
    Deleted,
    /// Messages not flagged `\Deleted`.
    NotDeleted,
    /// Messages flagged `\Seen`.
    Seen,
    /// Messages not flagged `\Seen`.
    Unseen,
    /// `From` header contains the text.
    From(String),
    /// `To` header contains the text.
    To(String),
    /// `Subject` header contains the text.
    Subject(String),
    /// Internal date on or after the day.
    Since(NaiveDate),
    /// Internal date before the day.
    Before(NaiveDate),
    /// Every operand matches. An empty list matches everything.
    And(Vec<SearchQuery>),
    /// Either operand matches.
    Or(Box<SearchQuery>, Box<SearchQuery>),
    /// The operand does not match.
    Not(Box<SearchQuery>),
}

impl SearchQuery {
    /// Conjunction of `self` and `other`, flattening nested conjunctions.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::All, q) | (q, Self::All) => q,
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), q) => {
                left.push(q);
                Self::And(left)
            }
            (q, Self::And(mut right)) => {
                right.insert(0, q);
                Self::And(right)
            }
            (left, right) => Self::And(vec![left, right]),
        }
    }

    /// Disjunction of `self` and `other`.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// Negation of `self`.
    #[must_use]
    pub fn not(self) -> Self {
        match self {
            Self::Deleted => Self::NotDeleted,
            Self::NotDeleted => Self::Deleted,
            Self::Seen => Self::Unseen,
            Self::Unseen => Self::Seen,
            Self::Not(inner) => *inner,
            q => Self::Not(Box::new(q)),
        }
    }

    /// `self` restricted to messages not flagged `\Deleted`.
    #[must_use]
    pub fn excluding_deleted(self) -> Self {
        self.and(Self::NotDeleted)
    }

    /// Byte length of the longest text operand that has to be sent as a
    /// literal, or `None` when every operand is ASCII.
    #[must_use]
    pub fn longest_literal(&self) -> Option<usize> {
        match self {
            Self::From(s) | Self::To(s) | Self::Subject(s) => {
                (!s.is_ascii()).then(|| Text(s).literal_len())
            }
            Self::And(items) => items.iter().filter_map(Self::longest_literal).max(),
            Self::Or(a, b) => a.longest_literal().max(b.longest_literal()),
            Self::Not(q) => q.longest_literal(),
            _ => None,
        }
    }

    /// Renders the criteria for `UID SEARCH`.
    ///
    /// ASCII text is quoted. Other text goes out as a non-synchronizing
    /// literal (RFC 7888) under a `CHARSET UTF-8` prefix, so the server must
    /// advertise `LITERAL+`, or `LITERAL-` for literals up to 4096 bytes.
    #[must_use]
    pub fn to_imap(&self) -> String {
        if self.longest_literal().is_some() {
            format!("CHARSET UTF-8 {self}")
        } else {
            self.to_string()
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(items) if items.len() > 1 => write!(f, "({self})"),
            _ => write!(f, "{self}"),
        }
    }
}

impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "ALL"),
            Self::Deleted => write!(f, "DELETED"),
            Self::NotDeleted => write!(f, "UNDELETED"),
            Self::Seen => write!(f, "SEEN"),
            Self::Unseen => write!(f, "UNSEEN"),
            Self::From(s) => write!(f, "FROM {}", Text(s)),
            Self::To(s) => write!(f, "TO {}", Text(s)),
            Self::Subject(s) => write!(f, "SUBJECT {}", Text(s)),
            Self::Since(date) => write!(f, "SINCE {}", date.format("%-d-%b-%Y")),
            Self::Before(date) => write!(f, "BEFORE {}", date.format("%-d-%b-%Y")),
            Self::And(items) if items.is_empty() => write!(f, "ALL"),
            Self::And(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    item.fmt_operand(f)?;
                }
                Ok(())
            }
            Self::Or(a, b) => {
                write!(f, "OR ")?;
                a.fmt_operand(f)?;
                write!(f, " ")?;
                b.fmt_operand(f)
            }
            Self::Not(q) => {
                write!(f, "NOT ")?;
                q.fmt_operand(f)
            }
        }
    }
}

/// A text operand: a quoted string when ASCII, a `{n+}` literal otherwise.
/// CR and LF become spaces either way.
struct Text<'a>(&'a str);

impl Text<'_> {
    fn chars(&self) -> impl Iterator<Item = char> + '_ {
        self.0
            .chars()
            .map(|c| if matches!(c, '\r' | '\n') { ' ' } else { c })
    }

    fn literal_len(&self) -> usize {
        self.chars().map(char::len_utf8).sum()
    }
}

impl fmt::Display for Text<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.0.is_ascii() {
            write!(f, "{{{}+}}\r\n", self.literal_len())?;
            return self.chars().try_for_each(|c| write!(f, "{c}"));
        }
        write!(f, "\"")?;
        for c in self.chars() {
            match c {
                '"' | '\\' => write!(f, "\\{c}")?,
                c => write!(f, "{c}")?,
            }
        }
        write!(f, "\"")
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
    use super::*;

    #[test]
    fn test_simple_keys() {
        assert_eq!(SearchQuery::All.to_imap(), "ALL");
        assert_eq!(SearchQuery::NotDeleted.to_imap(), "UNDELETED");
        assert_eq!(SearchQuery::Unseen.to_imap(), "UNSEEN");
        assert_eq!(SearchQuery::And(vec![]).to_imap(), "ALL");
    }

    #[test]
    fn test_excluding_deleted() {
        assert_eq!(SearchQuery::All.excluding_deleted(), SearchQuery::NotDeleted);
        assert_eq!(
            SearchQuery::Unseen.excluding_deleted().to_imap(),
            "UNSEEN UNDELETED"
        );
        let nested = SearchQuery::Unseen
            .and(SearchQuery::From("alice".into()))
            .excluding_deleted();
        assert_eq!(nested.to_imap(), "UNSEEN FROM \"alice\" UNDELETED");
    }

    #[test]
    fn test_quoting() {
        let q = SearchQuery::Subject("say \"hi\" \\ bye\r\nnow".into());
        assert_eq!(q.to_imap(), r#"SUBJECT "say \"hi\" \\ bye  now""#);
    }

    #[test]
    fn test_dates() {
        let day = NaiveDate::from_ymd_opt(2024, 2, 5).unwrap();
        assert_eq!(SearchQuery::Since(day).to_imap(), "SINCE 5-Feb-2024");
        assert_eq!(SearchQuery::Before(day).to_imap(), "BEFORE 5-Feb-2024");
    }

    #[test]
    fn test_or_and_not_parenthesise_conjunctions() {
        let q = SearchQuery::From("a".into())
            .and(SearchQuery::Seen)
            .or(SearchQuery::To("b".into()));
        assert_eq!(q.to_imap(), "OR (FROM \"a\" SEEN) TO \"b\"");

        let n = SearchQuery::From("a".into()).and(SearchQuery::Seen).not();
        assert_eq!(n.to_imap(), "NOT (FROM \"a\" SEEN)");
    }

    #[test]
    fn test_not_simplifies() {
        assert_eq!(SearchQuery::Deleted.not(), SearchQuery::NotDeleted);
        assert_eq!(SearchQuery::From("x".into()).not().not(), SearchQuery::From("x".into()));
    }

    #[test]
    fn test_non_ascii_text_is_a_literal() {
        let q = SearchQuery::Subject("Grüße".into()).excluding_deleted();
        assert_eq!(q.longest_literal(), Some(7));
        assert_eq!(q.to_imap(), "CHARSET UTF-8 SUBJECT {7+}\r\nGrüße UNDELETED");
    }

    #[test]
    fn test_ascii_text_needs_no_literal() {
        let q = SearchQuery::From("alice".into()).or(SearchQuery::To("bob".into()));
        assert_eq!(q.longest_literal(), None);
        assert!(!q.to_imap().starts_with("CHARSET"));
    }

    #[test]
    fn test_longest_literal_over_nested_operands() {
        let q = SearchQuery::From("José".into())
            .and(SearchQuery::Subject("日本語".into()).not())
            .and(SearchQuery::To("x".into()));
        assert_eq!(q.longest_literal(), Some(9));
        assert_eq!(
            q.to_imap(),
            "CHARSET UTF-8 FROM {5+}\r\nJosé NOT SUBJECT {9+}\r\n日本語 TO \"x\""
        );
    }
}

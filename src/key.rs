//! Composite keys and queries (spec.md §3, §4.1).
//!
//! A [`Key`] is an ordered, immutable sequence of 1..=255 fragments, each
//! either a validated UTF-8 string or an IEEE-754 double, with the first
//! fragment always a string. A [`Query`] is shaped the same way but may
//! additionally carry inclusive range fragments at any position, used for
//! prefix and range traversal of the [`crate::index::Index`].

use std::cmp::Ordering;
use std::fmt;

use snafu::ensure;

use crate::error::{
    BadSyntaxSnafu, FirstFragmentNotStringSnafu, FragmentCountSnafu, InvalidStringFragmentSnafu,
    KeyError, MismatchedRangeBoundTypesSnafu, TruncatedSnafu,
};

const MAX_FRAGMENTS: usize = 255;

/// A single key fragment: either a validated string or a number.
#[derive(Clone, Debug, PartialEq)]
pub enum Fragment {
    String(String),
    Number(f64),
}

impl Fragment {
    fn type_tag(&self) -> u8 {
        match self {
            Fragment::String(_) => 0,
            Fragment::Number(_) => 1,
        }
    }

    fn same_type(&self, other: &Fragment) -> bool {
        self.type_tag() == other.type_tag()
    }

    /// Partial order used by range matching. Only meaningful between
    /// fragments of the same type; callers must check `same_type` first.
    fn partial_cmp_value(&self, other: &Fragment) -> Option<Ordering> {
        match (self, other) {
            (Fragment::String(a), Fragment::String(b)) => Some(a.cmp(b)),
            (Fragment::Number(a), Fragment::Number(b)) => a.partial_cmp(b),
            _ => None,
        }
    }

    fn validate_string(s: &str) -> Result<(), KeyError> {
        ensure!(
            !s.is_empty() && s.chars().all(is_fragment_char),
            InvalidStringFragmentSnafu {
                fragment: s.to_string()
            }
        );
        Ok(())
    }
}

fn is_fragment_char(c: char) -> bool {
    c.is_alphabetic() || c.is_numeric() || c == '_' || c == '-' || c == '@'
}

fn validate_fragments(fragments: &[Fragment]) -> Result<(), KeyError> {
    ensure!(
        !fragments.is_empty() && fragments.len() <= MAX_FRAGMENTS,
        FragmentCountSnafu {
            count: fragments.len()
        }
    );
    ensure!(
        matches!(fragments[0], Fragment::String(_)),
        FirstFragmentNotStringSnafu
    );
    for fragment in fragments {
        if let Fragment::String(s) = fragment {
            Fragment::validate_string(s)?;
        }
    }
    Ok(())
}

/// An immutable composite key.
#[derive(Clone, Debug, PartialEq)]
pub struct Key {
    fragments: Vec<Fragment>,
}

impl Key {
    /// Builds a key from fragments, validating structure and character class
    /// unless `validate` is `false` (used internally when re-materializing a
    /// key already known to be well-formed, e.g. from ledger bytes).
    pub fn new(fragments: Vec<Fragment>, validate: bool) -> Result<Self, KeyError> {
        if validate {
            validate_fragments(&fragments)?;
        }
        Ok(Key { fragments })
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Encodes this key into its binary on-wire form (spec.md §4.1):
    /// `num_fragments:u8 | (type:u8 | (len:u32_be | utf8_bytes) | f64_be){n}`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.fragments.len() * 9);
        buf.push(self.fragments.len() as u8);
        for fragment in &self.fragments {
            encode_fragment(fragment, &mut buf);
        }
        buf
    }

    /// Decodes a key from its binary form, returning the key and the number
    /// of bytes consumed so a caller decoding a larger record (e.g. a
    /// transaction header) can locate the next field.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), KeyError> {
        ensure!(!bytes.is_empty(), TruncatedSnafu { offset: 0usize });
        let num_fragments = bytes[0] as usize;
        let mut offset = 1;
        let mut fragments = Vec::with_capacity(num_fragments);
        for _ in 0..num_fragments {
            let (fragment, consumed) = decode_fragment(bytes, offset)?;
            fragments.push(fragment);
            offset += consumed;
        }
        let key = Key::new(fragments, false)?;
        Ok((key, offset))
    }

    /// Renders the dotted stringified form (spec.md §4.1): strings as-is,
    /// numbers prefixed with `#`.
    pub fn stringify(&self) -> String {
        self.fragments
            .iter()
            .map(stringify_fragment)
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Parses the dotted stringified form produced by [`Key::stringify`].
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        ensure!(
            !s.is_empty(),
            BadSyntaxSnafu {
                reason: "empty key string".to_string()
            }
        );
        let mut fragments = Vec::new();
        for part in s.split('.') {
            ensure!(
                !part.is_empty(),
                BadSyntaxSnafu {
                    reason: "bare keys may not contain empty (range) fragments".to_string()
                }
            );
            ensure!(
                !part.starts_with(">=") && !part.starts_with("<="),
                BadSyntaxSnafu {
                    reason: "bare keys may not contain range fragments".to_string()
                }
            );
            fragments.push(parse_literal_token(part)?);
        }
        Key::new(fragments, true)
    }

    /// Returns `true` if this key matches `query` under [`Query::matches`]
    /// semantics with the given `recursive` flag. Equivalent to
    /// `query.matches_key(self, recursive)`, provided as a convenience on
    /// `Key` to mirror spec.md §4.1's `key.matches(query, recursive)`.
    pub fn matches(&self, query: &Query, recursive: bool) -> bool {
        query.matches(self, recursive)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stringify())
    }
}

/// A single query fragment: either a literal (same as a key fragment) or an
/// inclusive range, only valid within a [`Query`].
#[derive(Clone, Debug, PartialEq)]
pub enum QueryFragment {
    Literal(Fragment),
    Range {
        from: Option<Fragment>,
        to: Option<Fragment>,
    },
}

impl QueryFragment {
    fn validate(&self) -> Result<(), KeyError> {
        match self {
            QueryFragment::Literal(Fragment::String(s)) => Fragment::validate_string(s),
            QueryFragment::Literal(Fragment::Number(_)) => Ok(()),
            QueryFragment::Range { from, to } => {
                if let (Some(from), Some(to)) = (from, to) {
                    ensure!(from.same_type(to), MismatchedRangeBoundTypesSnafu);
                }
                if let Some(Fragment::String(s)) = from {
                    Fragment::validate_string(s)?;
                }
                if let Some(Fragment::String(s)) = to {
                    Fragment::validate_string(s)?;
                }
                Ok(())
            }
        }
    }
}

/// An ordered sequence of query fragments used for exact, prefix, and range
/// lookups against the [`crate::index::Index`].
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    fragments: Vec<QueryFragment>,
}

impl Query {
    pub fn new(fragments: Vec<QueryFragment>, validate: bool) -> Result<Self, KeyError> {
        if validate {
            ensure!(
                !fragments.is_empty() && fragments.len() <= MAX_FRAGMENTS,
                FragmentCountSnafu {
                    count: fragments.len()
                }
            );
            ensure!(
                matches!(fragments[0], QueryFragment::Literal(Fragment::String(_))),
                FirstFragmentNotStringSnafu
            );
            for fragment in &fragments {
                fragment.validate()?;
            }
        }
        Ok(Query { fragments })
    }

    /// Builds a query matching exactly the given key (every fragment is a
    /// literal copied from `key`).
    pub fn exact(key: &Key) -> Self {
        Query {
            fragments: key
                .fragments()
                .iter()
                .cloned()
                .map(QueryFragment::Literal)
                .collect(),
        }
    }

    pub fn fragments(&self) -> &[QueryFragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn stringify(&self) -> String {
        self.fragments
            .iter()
            .map(stringify_query_fragment)
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn parse(s: &str) -> Result<Self, KeyError> {
        if s.is_empty() {
            return Query::new(Vec::new(), false);
        }
        let mut fragments = Vec::new();
        for part in s.split('.') {
            fragments.push(parse_query_token(part)?);
        }
        Query::new(fragments, true)
    }

    /// Matches `key` against this query. See spec.md §4.1 for full
    /// semantics, summarized: each position compares a literal or a range
    /// (type-checked, both bounds inclusive, open-ended where omitted);
    /// fails on the first mismatch. When `recursive`, a key with more
    /// fragments than the query still matches on the shared prefix; when not
    /// recursive, lengths must match exactly.
    pub fn matches(&self, key: &Key, recursive: bool) -> bool {
        if recursive {
            if key.len() < self.len() {
                return false;
            }
        } else if key.len() != self.len() {
            return false;
        }

        for (value, query_fragment) in key.fragments().iter().zip(self.fragments.iter()) {
            if !fragment_matches(value, query_fragment) {
                return false;
            }
        }
        true
    }
}

fn fragment_matches(value: &Fragment, query_fragment: &QueryFragment) -> bool {
    match query_fragment {
        QueryFragment::Literal(literal) => value == literal,
        QueryFragment::Range { from, to } => range_contains(value, from, to),
    }
}

/// `true` if `value` falls within the inclusive, optionally open-ended
/// `[from, to]` range. An empty range (`from` and `to` both `None`) matches
/// any value regardless of type. Shared by [`Query::matches`] and
/// [`crate::index::Index::get`]'s range-fragment descent.
pub(crate) fn range_contains(value: &Fragment, from: &Option<Fragment>, to: &Option<Fragment>) -> bool {
    if let Some(from) = from {
        if !value.same_type(from) {
            return false;
        }
        match value.partial_cmp_value(from) {
            Some(ord) if ord != Ordering::Less => {}
            _ => return false,
        }
    }
    if let Some(to) = to {
        if !value.same_type(to) {
            return false;
        }
        match value.partial_cmp_value(to) {
            Some(ord) if ord != Ordering::Greater => {}
            _ => return false,
        }
    }
    true
}

fn encode_fragment(fragment: &Fragment, buf: &mut Vec<u8>) {
    match fragment {
        Fragment::String(s) => {
            buf.push(0);
            let bytes = s.as_bytes();
            buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            buf.extend_from_slice(bytes);
        }
        Fragment::Number(n) => {
            buf.push(1);
            buf.extend_from_slice(&n.to_be_bytes());
        }
    }
}

fn decode_fragment(bytes: &[u8], offset: usize) -> Result<(Fragment, usize), KeyError> {
    ensure!(bytes.len() > offset, TruncatedSnafu { offset });
    match bytes[offset] {
        0 => {
            ensure!(bytes.len() >= offset + 5, TruncatedSnafu { offset });
            let len = u32::from_be_bytes(bytes[offset + 1..offset + 5].try_into().unwrap()) as usize;
            let start = offset + 5;
            let end = start + len;
            ensure!(bytes.len() >= end, TruncatedSnafu { offset });
            let s = std::str::from_utf8(&bytes[start..end])
                .map_err(|_| KeyError::BadSyntax {
                    reason: "fragment is not valid UTF-8".to_string(),
                })?
                .to_string();
            Ok((Fragment::String(s), 5 + len))
        }
        1 => {
            ensure!(bytes.len() >= offset + 9, TruncatedSnafu { offset });
            let n = f64::from_be_bytes(bytes[offset + 1..offset + 9].try_into().unwrap());
            Ok((Fragment::Number(n), 9))
        }
        other => Err(KeyError::BadSyntax {
            reason: format!("unknown fragment type tag {}", other),
        }),
    }
}

pub(crate) fn stringify_fragment(fragment: &Fragment) -> String {
    match fragment {
        Fragment::String(s) => s.clone(),
        Fragment::Number(n) => format!("#{}", n),
    }
}

fn stringify_query_fragment(fragment: &QueryFragment) -> String {
    match fragment {
        QueryFragment::Literal(literal) => stringify_fragment(literal),
        QueryFragment::Range { from, to } => {
            let mut s = String::new();
            if let Some(from) = from {
                s.push_str(">=");
                s.push_str(&stringify_fragment(from));
            }
            if let Some(to) = to {
                s.push_str("<=");
                s.push_str(&stringify_fragment(to));
            }
            s
        }
    }
}

fn parse_literal_token(part: &str) -> Result<Fragment, KeyError> {
    if let Some(rest) = part.strip_prefix('#') {
        let n: f64 = rest.parse().map_err(|_| KeyError::BadSyntax {
            reason: format!("{:?} is not a valid number literal", part),
        })?;
        Ok(Fragment::Number(n))
    } else {
        Fragment::validate_string(part)?;
        Ok(Fragment::String(part.to_string()))
    }
}

fn parse_query_token(part: &str) -> Result<QueryFragment, KeyError> {
    if part.is_empty() {
        return Ok(QueryFragment::Range {
            from: None,
            to: None,
        });
    }

    if let Some(rest) = part.strip_prefix(">=") {
        if let Some(split_at) = rest.find("<=") {
            let (from_str, to_str) = rest.split_at(split_at);
            let to_str = &to_str[2..];
            return Ok(QueryFragment::Range {
                from: Some(parse_literal_token(from_str)?),
                to: Some(parse_literal_token(to_str)?),
            });
        }
        return Ok(QueryFragment::Range {
            from: Some(parse_literal_token(rest)?),
            to: None,
        });
    }

    if let Some(rest) = part.strip_prefix("<=") {
        return Ok(QueryFragment::Range {
            from: None,
            to: Some(parse_literal_token(rest)?),
        });
    }

    Ok(QueryFragment::Literal(parse_literal_token(part)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fragments: Vec<Fragment>) -> Key {
        Key::new(fragments, true).expect("valid key")
    }

    #[test]
    fn rejects_non_string_first_fragment() {
        let err = Key::new(vec![Fragment::Number(1.0)], true).unwrap_err();
        assert!(matches!(err, KeyError::FirstFragmentNotString));
    }

    #[test]
    fn rejects_invalid_characters() {
        let err = Key::new(vec![Fragment::String("has space".into())], true).unwrap_err();
        assert!(matches!(err, KeyError::InvalidStringFragment { .. }));
    }

    #[test]
    fn byte_round_trip() {
        let k = key(vec![
            Fragment::String("users".into()),
            Fragment::Number(42.0),
            Fragment::String("profile".into()),
        ]);
        let bytes = k.to_bytes();
        let (decoded, consumed) = Key::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, k);
    }

    #[test]
    fn stringify_round_trip() {
        let k = key(vec![Fragment::String("data".into()), Fragment::Number(7.0)]);
        let s = k.stringify();
        assert_eq!(s, "data.#7");
        let parsed = Key::parse(&s).unwrap();
        assert_eq!(parsed, k);
    }

    #[test]
    fn query_exact_matches_identical_key() {
        let k = key(vec![Fragment::String("a".into()), Fragment::Number(1.0)]);
        let q = Query::exact(&k);
        assert!(q.matches(&k, false));
    }

    #[test]
    fn query_range_matches_inclusive_bounds() {
        let q = Query::new(
            vec![
                QueryFragment::Literal(Fragment::String("data".into())),
                QueryFragment::Range {
                    from: Some(Fragment::Number(7.0)),
                    to: Some(Fragment::Number(9.0)),
                },
            ],
            true,
        )
        .unwrap();

        for n in [7.0, 8.0, 9.0] {
            let k = key(vec![Fragment::String("data".into()), Fragment::Number(n)]);
            assert!(q.matches(&k, false), "{} should match", n);
        }
        for n in [6.0, 10.0] {
            let k = key(vec![Fragment::String("data".into()), Fragment::Number(n)]);
            assert!(!q.matches(&k, false), "{} should not match", n);
        }
    }

    #[test]
    fn empty_range_matches_any_value_and_type() {
        let q = Query::new(
            vec![QueryFragment::Range {
                from: None,
                to: None,
            }],
            true,
        )
        .unwrap();
        assert!(q.matches(&key(vec![Fragment::String("anything".into())]), false));
        assert!(q.matches(&key(vec![Fragment::Number(3.5)]), false));
    }

    #[test]
    fn recursive_allows_trailing_fragments() {
        let q = Query::new(
            vec![QueryFragment::Literal(Fragment::String("users".into()))],
            true,
        )
        .unwrap();
        let k = key(vec![
            Fragment::String("users".into()),
            Fragment::Number(1.0),
            Fragment::String("name".into()),
        ]);
        assert!(q.matches(&k, true));
        assert!(!q.matches(&k, false));
    }

    #[test]
    fn query_stringify_round_trip_with_range() {
        let q = Query::new(
            vec![
                QueryFragment::Literal(Fragment::String("data".into())),
                QueryFragment::Range {
                    from: Some(Fragment::Number(7.0)),
                    to: Some(Fragment::Number(9.0)),
                },
            ],
            true,
        )
        .unwrap();
        let s = q.stringify();
        assert_eq!(s, "data.>=#7<=#9");
        let parsed = Query::parse(&s).unwrap();
        assert_eq!(parsed, q);
    }

    #[test]
    fn consecutive_dots_denote_empty_range() {
        let parsed = Query::parse("data..#9").unwrap();
        assert_eq!(
            parsed.fragments()[1],
            QueryFragment::Range {
                from: None,
                to: None
            }
        );
    }

    mod proptests {
        use super::*;
        use proptest::{prop_assert_eq, proptest};

        fn arb_string_fragment() -> impl proptest::strategy::Strategy<Value = String> {
            "[a-zA-Z][a-zA-Z0-9_@-]{0,12}"
        }

        proptest! {
            #[test]
            fn key_byte_round_trip(first in arb_string_fragment(), n in -1.0e12f64..1.0e12f64) {
                let k = Key::new(
                    vec![Fragment::String(first), Fragment::Number(n)],
                    true,
                ).unwrap();
                let bytes = k.to_bytes();
                let (decoded, consumed) = Key::from_bytes(&bytes).unwrap();
                prop_assert_eq!(consumed, bytes.len());
                prop_assert_eq!(decoded, k);
            }

            #[test]
            fn key_stringify_round_trip(first in arb_string_fragment(), second in arb_string_fragment()) {
                let k = Key::new(
                    vec![Fragment::String(first), Fragment::String(second)],
                    true,
                ).unwrap();
                let parsed = Key::parse(&k.stringify()).unwrap();
                prop_assert_eq!(parsed, k);
            }
        }
    }
}

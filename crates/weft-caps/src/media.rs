//! Media URNs: tag sets identifying a media type.

use std::{fmt, str::FromStr};

use crate::error::UrnError;

/// A media URN: the `media:` scheme followed by `;`-separated tags.
///
/// Tag order is preserved for display but is irrelevant to matching.
/// An empty tag set (`media:`) is the wildcard and accepts every media
/// URN.
///
/// # Invariants
///
/// - Tags are non-empty strings and unique within one URN (enforced by
///   [`MediaUrn::parse`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUrn {
    tags: Vec<String>,
}

impl MediaUrn {
    /// Scheme prefix for media URNs.
    pub const SCHEME: &'static str = "media:";

    /// Parse a media URN from its text form.
    ///
    /// # Errors
    ///
    /// - [`UrnError::UnknownScheme`] if the input lacks the `media:` prefix
    /// - [`UrnError::EmptySegment`] on empty tags (e.g. `media:a;;b`)
    /// - [`UrnError::DuplicateTag`] if a tag repeats
    pub fn parse(input: &str) -> Result<Self, UrnError> {
        let body = input.strip_prefix(Self::SCHEME).ok_or_else(|| UrnError::UnknownScheme {
            input: input.to_string(),
            expected: Self::SCHEME,
        })?;

        let mut tags = Vec::new();
        if !body.is_empty() {
            for tag in body.split(';') {
                push_tag(&mut tags, tag, input)?;
            }
        }

        Ok(Self { tags })
    }

    /// The wildcard media URN (`media:`), which accepts everything.
    #[must_use]
    pub fn wildcard() -> Self {
        Self { tags: Vec::new() }
    }

    /// Whether this URN carries no tags and thus accepts every instance.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.tags.is_empty()
    }

    /// The URN's tags in declaration order.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Does `self`, read as a pattern, accept `instance`?
    ///
    /// True when every tag of `self` appears in `instance`. The wildcard
    /// accepts everything; nothing but the wildcard accepts the wildcard.
    #[must_use]
    pub fn accepts(&self, instance: &Self) -> bool {
        self.tags.iter().all(|t| instance.tags.contains(t))
    }

    /// Does `self`, read as an instance, satisfy `pattern`?
    ///
    /// Inverse of [`MediaUrn::accepts`].
    #[must_use]
    pub fn conforms_to(&self, pattern: &Self) -> bool {
        pattern.accepts(self)
    }

    /// Number of non-wildcard tags. Higher is more specific.
    #[must_use]
    pub fn specificity(&self) -> u64 {
        self.tags.len() as u64
    }
}

impl FromStr for MediaUrn {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MediaUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::SCHEME, self.tags.join(";"))
    }
}

/// Validate a tag and append it to `tags`.
pub(crate) fn push_tag(tags: &mut Vec<String>, tag: &str, input: &str) -> Result<(), UrnError> {
    if tag.is_empty() {
        return Err(UrnError::EmptySegment { input: input.to_string() });
    }
    if tags.iter().any(|t| t == tag) {
        return Err(UrnError::DuplicateTag { tag: tag.to_string(), input: input.to_string() });
    }
    tags.push(tag.to_string());
    Ok(())
}

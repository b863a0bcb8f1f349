//! Cap URNs: capability identifiers with input/output specs.

use std::{fmt, str::FromStr};

use crate::{
    error::UrnError,
    media::{MediaUrn, push_tag},
};

/// A cap URN: the `cap:` scheme with an `in=` spec, an `out=` spec, and
/// arbitrary extra tags.
///
/// `cap:in=media:json;out=media:png;thumbnail` names a capability that
/// consumes JSON, produces PNG, and is further tagged `thumbnail`.
///
/// Matching is component-wise subset matching: a pattern accepts an
/// instance when its in-spec accepts the instance's in-spec, its out-spec
/// accepts the instance's out-spec, and its extra tags all appear on the
/// instance. `cap:in=media:;out=media:` is the fully generic pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapUrn {
    in_spec: MediaUrn,
    out_spec: MediaUrn,
    tags: Vec<String>,
}

impl CapUrn {
    /// Scheme prefix for cap URNs.
    pub const SCHEME: &'static str = "cap:";

    /// Parse a cap URN from its text form.
    ///
    /// # Errors
    ///
    /// - [`UrnError::UnknownScheme`] if the input lacks the `cap:` prefix
    /// - [`UrnError::MissingSpec`] / [`UrnError::DuplicateSpec`] if `in=`
    ///   or `out=` is absent or repeated
    /// - [`UrnError::UnknownKey`] on a `key=value` segment with an
    ///   unrecognized key
    /// - [`UrnError::EmptySegment`] / [`UrnError::DuplicateTag`] on bad
    ///   extra tags
    pub fn parse(input: &str) -> Result<Self, UrnError> {
        let body = input.strip_prefix(Self::SCHEME).ok_or_else(|| UrnError::UnknownScheme {
            input: input.to_string(),
            expected: Self::SCHEME,
        })?;

        let mut in_spec = None;
        let mut out_spec = None;
        let mut tags = Vec::new();

        for segment in body.split(';') {
            if let Some(value) = segment.strip_prefix("in=") {
                if in_spec.is_some() {
                    return Err(UrnError::DuplicateSpec { which: "in", input: input.to_string() });
                }
                in_spec = Some(MediaUrn::parse(value)?);
            } else if let Some(value) = segment.strip_prefix("out=") {
                if out_spec.is_some() {
                    return Err(UrnError::DuplicateSpec { which: "out", input: input.to_string() });
                }
                out_spec = Some(MediaUrn::parse(value)?);
            } else if let Some((key, _)) = segment.split_once('=') {
                return Err(UrnError::UnknownKey { key: key.to_string(), input: input.to_string() });
            } else {
                push_tag(&mut tags, segment, input)?;
            }
        }

        let in_spec =
            in_spec.ok_or_else(|| UrnError::MissingSpec { which: "in", input: input.to_string() })?;
        let out_spec = out_spec
            .ok_or_else(|| UrnError::MissingSpec { which: "out", input: input.to_string() })?;

        Ok(Self { in_spec, out_spec, tags })
    }

    /// The fully generic cap URN (`cap:in=media:;out=media:`): wildcard
    /// input and output, no extra tags. Accepts every cap URN.
    #[must_use]
    pub fn generic() -> Self {
        Self { in_spec: MediaUrn::wildcard(), out_spec: MediaUrn::wildcard(), tags: Vec::new() }
    }

    /// The capability's input spec.
    #[must_use]
    pub fn in_spec(&self) -> &MediaUrn {
        &self.in_spec
    }

    /// The capability's output spec.
    #[must_use]
    pub fn out_spec(&self) -> &MediaUrn {
        &self.out_spec
    }

    /// Extra cap-level tags in declaration order.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Does `self`, read as a pattern, accept `instance`?
    ///
    /// Component-wise: in-spec, out-spec, and extra tags must all match.
    #[must_use]
    pub fn accepts(&self, instance: &Self) -> bool {
        self.in_spec.accepts(&instance.in_spec)
            && self.out_spec.accepts(&instance.out_spec)
            && self.tags.iter().all(|t| instance.tags.contains(t))
    }

    /// Does `self`, read as an instance, satisfy `pattern`?
    ///
    /// Inverse of [`CapUrn::accepts`].
    #[must_use]
    pub fn conforms_to(&self, pattern: &Self) -> bool {
        pattern.accepts(self)
    }

    /// Total count of non-wildcard tags across in-spec, out-spec, and
    /// extra tags. Higher is more specific.
    #[must_use]
    pub fn specificity(&self) -> u64 {
        self.in_spec.specificity() + self.out_spec.specificity() + self.tags.len() as u64
    }
}

impl FromStr for CapUrn {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CapUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}in={};out={}", Self::SCHEME, self.in_spec, self.out_spec)?;
        for tag in &self.tags {
            write!(f, ";{tag}")?;
        }
        Ok(())
    }
}

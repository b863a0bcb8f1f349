//! Error type for URN parsing.

use thiserror::Error;

/// Errors produced while parsing a media or cap URN.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrnError {
    /// Input does not start with the expected scheme prefix.
    #[error("unknown scheme in {input:?}: expected {expected:?} prefix")]
    UnknownScheme {
        /// The full input that failed to parse
        input: String,
        /// The scheme prefix that was expected
        expected: &'static str,
    },

    /// A `;`-separated segment was empty (e.g. a trailing `;`).
    #[error("empty segment in {input:?}")]
    EmptySegment {
        /// The full input that failed to parse
        input: String,
    },

    /// The same tag appeared twice in one tag set.
    #[error("duplicate tag {tag:?} in {input:?}")]
    DuplicateTag {
        /// The repeated tag
        tag: String,
        /// The full input that failed to parse
        input: String,
    },

    /// A cap URN is missing its `in=` or `out=` spec.
    #[error("cap urn {input:?} is missing its {which}= spec")]
    MissingSpec {
        /// Which spec was absent (`in` or `out`)
        which: &'static str,
        /// The full input that failed to parse
        input: String,
    },

    /// A cap URN carried more than one `in=` or `out=` spec.
    #[error("cap urn {input:?} has more than one {which}= spec")]
    DuplicateSpec {
        /// Which spec was repeated (`in` or `out`)
        which: &'static str,
        /// The full input that failed to parse
        input: String,
    },

    /// A `key=value` segment used a key other than `in` or `out`.
    #[error("unknown key {key:?} in {input:?}")]
    UnknownKey {
        /// The unrecognized key
        key: String,
        /// The full input that failed to parse
        input: String,
    },
}

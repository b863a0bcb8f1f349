//! Tagged URNs for capability addressing.
//!
//! Two URN kinds share one matching model:
//!
//! - Media URNs (`media:png;image`) identify a media type as a set of tags.
//! - Cap URNs (`cap:in=media:json;out=media:png;thumbnail`) identify a
//!   capability by its input spec, output spec, and arbitrary extra tags.
//!
//! Matching is subset-based: a URN with fewer tags is a *pattern* that
//! accepts any *instance* carrying at least those tags. A URN with zero
//! tags is a wildcard and accepts everything. `specificity()` counts
//! non-wildcard tags, so callers can rank candidates from generic to
//! specific.
//!
//! # Grammar
//!
//! ```text
//! media-urn = "media:" [ tag *( ";" tag ) ]
//! cap-urn   = "cap:" "in=" media-urn ";" "out=" media-urn *( ";" tag )
//! ```
//!
//! Within a cap URN, the `in=`/`out=` values extend to the next `;`;
//! refinement beyond a single media tag goes into the cap's extra tags.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cap;
mod error;
mod media;

pub use cap::CapUrn;
pub use error::UrnError;
pub use media::MediaUrn;

//! Message identifiers.

use std::fmt;

/// A message identifier: either a 16-byte opaque value or an unsigned
/// 64-bit integer.
///
/// Opaque identifiers (UUID-shaped) carry end-to-end request identity and
/// are minted by callers. Integer identifiers are reserved for
/// fabric-internal use: HELLO frames use [`MessageId::HELLO`], and the
/// switch allocates integer routing identifiers from a counter.
///
/// Equality is structural; `Opaque` and `Int` never compare equal, even
/// when the opaque bytes encode the same number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageId {
    /// 16-byte opaque identifier.
    Opaque([u8; 16]),
    /// Fabric-internal integer identifier.
    Int(u64),
}

impl MessageId {
    /// The well-known identifier carried by HELLO frames.
    pub const HELLO: Self = Self::Int(0);
}

impl From<[u8; 16]> for MessageId {
    fn from(bytes: [u8; 16]) -> Self {
        Self::Opaque(bytes)
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        Self::Int(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opaque(bytes) => {
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            },
            Self::Int(value) => write!(f, "#{value}"),
        }
    }
}

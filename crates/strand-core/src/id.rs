//! Strongly-typed identifiers for strand entities.
//!
//! Two identifier families live here:
//!
//! - **Surrogate row IDs** (ULID-backed): lexicographically sortable by
//!   creation time and globally unique without coordination.
//! - **Wire trace IDs** ([`TraceId`], [`SpanId`]): W3C trace-context
//!   compatible hex identifiers. Span IDs can be derived deterministically
//!   from a trace ID and a seed so a logical span stays stable across
//!   retries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use ulid::Ulid;

use crate::error::{Error, Result};

fn encode_hex(bytes: &[u8]) -> String {
    use fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn decode_hex<const N: usize>(s: &str, what: &str) -> Result<[u8; N]> {
    if s.len() != N * 2 {
        return Err(Error::InvalidId {
            message: format!("{what} must be {} hex chars, got {}", N * 2, s.len()),
        });
    }
    let mut bytes = [0u8; N];
    for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
        let pair = std::str::from_utf8(chunk).map_err(|_| Error::InvalidId {
            message: format!("{what} contains non-ascii characters"),
        })?;
        bytes[i] = u8::from_str_radix(pair, 16).map_err(|_| Error::InvalidId {
            message: format!("{what} contains non-hex characters: {pair:?}"),
        })?;
    }
    Ok(bytes)
}

/// A W3C-compatible trace identifier: 16 random bytes, rendered as 32
/// lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    /// Generates a new random trace ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// Creates a trace ID from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_hex(&self.0))
    }
}

impl FromStr for TraceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        decode_hex::<16>(&s.to_ascii_lowercase(), "trace ID").map(Self)
    }
}

impl Serialize for TraceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TraceId {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A W3C-compatible span identifier: 8 bytes, rendered as 16 lowercase hex
/// characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId([u8; 8]);

impl SpanId {
    /// Generates a new random span ID.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().into_bytes();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&uuid[..8]);
        Self(bytes)
    }

    /// Derives a deterministic span ID from a trace ID and a seed.
    ///
    /// The ID is the first 8 bytes of `SHA1(trace_id ‖ seed)`, where the
    /// trace ID contributes its 32-char hex rendering. The same
    /// `(trace_id, seed)` pair always yields the same span ID, which keeps a
    /// logical span stable across retries.
    #[must_use]
    pub fn deterministic(trace_id: &TraceId, seed: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(trace_id.to_string().as_bytes());
        hasher.update(seed.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self(bytes)
    }

    /// Creates a span ID from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_hex(&self.0))
    }
}

impl FromStr for SpanId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        decode_hex::<8>(&s.to_ascii_lowercase(), "span ID").map(Self)
    }
}

impl Serialize for SpanId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SpanId {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Formats a W3C `traceparent` header value for the given trace/span pair.
///
/// Format: `00-{trace_id}-{span_id}-01` (version 00, sampled flag set).
#[must_use]
pub fn traceparent(trace_id: &TraceId, span_id: &SpanId) -> String {
    format!("00-{trace_id}-{span_id}-01")
}

macro_rules! ulid_id {
    ($(#[$doc:meta])* $name:ident, $what:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique ID.
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an ID from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!(concat!("invalid ", $what, " '{}': {}"), s, e),
                })
            }
        }
    };
}

ulid_id!(
    /// A unique identifier for a runtime environment.
    EnvironmentId,
    "environment ID"
);

ulid_id!(
    /// A unique identifier for a project.
    ProjectId,
    "project ID"
);

ulid_id!(
    /// A surrogate identifier for a persisted event record.
    EventRecordId,
    "event record ID"
);

ulid_id!(
    /// A unique identifier for a queue.
    QueueId,
    "queue ID"
);

ulid_id!(
    /// A unique identifier for an event dispatcher.
    DispatcherId,
    "dispatcher ID"
);

ulid_id!(
    /// A unique identifier for a pipeline step.
    PipelineStepId,
    "pipeline step ID"
);

ulid_id!(
    /// A unique identifier for a pipeline run.
    PipelineRunId,
    "pipeline run ID"
);

ulid_id!(
    /// A surrogate identifier for a persisted span row.
    SpanRecordId,
    "span record ID"
);

ulid_id!(
    /// A unique identifier for an external account.
    AccountId,
    "account ID"
);

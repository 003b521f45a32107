//! # Trace-Context Codec
//!
//! Converts a [`TraceContext`] to and from the compact `traceparent` token carried in
//! message metadata:
//!
//! ```text
//! {version}-{trace_id}-{span_id}-{sampled_flag}
//!    00     -  4bf9...  - 00f0... -     01
//! ```
//!
//! Decoding is lenient on purpose. Only the field count and the version are checked, the
//! identifiers are kept opaque, and the sampled flag falls back to `true` unless the token
//! explicitly says `00`.

use std::fmt;
use std::str::FromStr;

use snafu::Snafu;

/// The only token version accepted on decode and emitted on encode.
pub const SUPPORTED_VERSION: &str = "00";

const SAMPLED_FLAG: &str = "01";
const NOT_SAMPLED_FLAG: &str = "00";
const FIELD_SEPARATOR: char = '-';

/// Reasons a `traceparent` token cannot be turned into a [`TraceContext`].
///
/// None of these are fatal to message delivery: a caller that gets one treats the message
/// as carrying no trace context.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer than three `-` separated fields
    #[snafu(display("traceparent exists, but it has illegal format: {token}"))]
    Malformed {
        /// the rejected token
        token: String,
    },

    /// The first field is not [`SUPPORTED_VERSION`]
    #[snafu(display("traceparent exists, but it has unknown version: {token}"))]
    UnsupportedVersion {
        /// the rejected token
        token: String,
        /// the version field found in the token
        version: String,
    },
}

/// An identifier handed to [`TraceContext::new`] contains the `-` field separator.
///
/// The token such a context encodes to would split the identifier into separate fields and
/// decode to a different context.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(display("trace identifier {id:?} contains the field separator '-'"))]
pub struct InvalidIdentifier {
    /// the rejected identifier
    pub id: String,
}

/// Identifiers of one node in a distributed causal chain.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TraceContext {
    trace_id: String,
    span_id: String,
    sampled: bool,
}

impl TraceContext {
    /// Builds a version `00` context from its identifiers.
    ///
    /// # Errors
    /// - `InvalidIdentifier` if either identifier contains `-`.
    pub fn new(
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        sampled: bool,
    ) -> Result<Self, InvalidIdentifier> {
        let trace_id = trace_id.into();
        let span_id = span_id.into();
        for id in [&trace_id, &span_id] {
            if id.contains(FIELD_SEPARATOR) {
                return InvalidIdentifierSnafu { id: id.as_str() }.fail();
            }
        }
        Ok(Self::from_fields(trace_id, span_id, sampled))
    }

    /// Builds a context from identifiers already known to be free of `-`.
    pub(crate) fn from_fields(trace_id: String, span_id: String, sampled: bool) -> Self {
        Self {
            trace_id,
            span_id,
            sampled,
        }
    }

    /// Always [`SUPPORTED_VERSION`]; other versions never decode.
    pub fn version(&self) -> &'static str {
        SUPPORTED_VERSION
    }

    /// Identifier shared by every span in the chain.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Identifier of the one span this context describes.
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Whether the tracing backend should record this chain.
    pub fn sampled(&self) -> bool {
        self.sampled
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = if self.sampled {
            SAMPLED_FLAG
        } else {
            NOT_SAMPLED_FLAG
        };
        write!(
            f,
            "{SUPPORTED_VERSION}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{flag}",
            self.trace_id, self.span_id
        )
    }
}

impl FromStr for TraceContext {
    type Err = DecodeError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        decode(token)
    }
}

/// Formats `context` as a `traceparent` token. Never fails.
pub fn encode(context: &TraceContext) -> String {
    context.to_string()
}

/// Parses a `traceparent` token.
///
/// Trailing empty fields are dropped before counting, so `"00-abc-"` is malformed while
/// `"00-abc-def-"` decodes with the default sampled flag. Fields past the fourth are ignored.
///
/// # Errors
/// - `Malformed` if fewer than three fields remain.
/// - `UnsupportedVersion` if the first field is not `00`.
pub fn decode(token: &str) -> Result<TraceContext, DecodeError> {
    let mut fields: Vec<&str> = token.split(FIELD_SEPARATOR).collect();
    while fields.last().is_some_and(|field| field.is_empty()) {
        fields.pop();
    }

    if fields.len() < 3 {
        return MalformedSnafu { token }.fail();
    }

    if fields[0] != SUPPORTED_VERSION {
        return UnsupportedVersionSnafu {
            token,
            version: fields[0],
        }
        .fail();
    }

    let sampled = match fields.get(3) {
        Some(&SAMPLED_FLAG) => true,
        // Anything other than an explicit "not sampled" keeps the trace.
        Some(flag) => *flag != NOT_SAMPLED_FLAG,
        None => true,
    };

    Ok(TraceContext::from_fields(fields[1].to_string(), fields[2].to_string(), sampled))
}

use std::net::SocketAddr;

use hickory_proto::error::ProtoError;
use hickory_proto::op::ResponseCode;
use thiserror::Error;

use crate::query::Query;

/// Raised while turning rule definitions into a [`crate::engine::RuleSet`].
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("no rule syntax matches: {0}")]
    NoMatch(String),

    #[error("invalid domain pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("invalid domain name {name:?}: {source}")]
    Name {
        name: String,
        #[source]
        source: ProtoError,
    },

    #[error("unknown record type: {0}")]
    RecordType(String),

    #[error("unknown record class: {0}")]
    RecordClass(String),

    #[error("invalid resolver address: {0}")]
    Resolver(String),

    #[error("rule needs at least one resolver")]
    NoResolvers,

    #[error("line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: Box<RuleError>,
    },
}

/// Failure of a single upstream exchange inside a race.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream timeout")]
    Timeout,

    #[error("upstream io: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed upstream response: {0}")]
    Proto(#[from] ProtoError),

    #[error("upstream answered {0}")]
    Rcode(ResponseCode),

    #[error("upstream answer has no address records")]
    NoAnswer,

    #[error("resolution task failed: {0}")]
    Task(String),
}

/// The race yielded no usable answer.
#[derive(Debug, Error)]
#[error("could not resolve query {query} using {resolvers:?}: {cause}")]
pub struct NetworkError {
    pub query: Query,
    pub resolvers: Vec<SocketAddr>,
    #[source]
    pub cause: UpstreamError,
}

/// Terminal failure of one evaluation pass.
#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("rewrite chain exceeded depth {depth} at {name}")]
    RewriteLoop { depth: usize, name: String },

    #[error("encode response: {0}")]
    Encode(#[from] ProtoError),
}

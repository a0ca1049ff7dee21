use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use hickory_proto::rr::{DNSClass, Name, RecordType};
use regex::{Regex, RegexBuilder};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{EvaluateError, RuleError};
use crate::query::{Context, Query};
use crate::resolver::{ResolverPool, Transport, parse_resolvers};
use crate::response;
use crate::syntax::{RuleDefinition, RuleKind};

/// Compiled domain pattern. Matches the whole query name, ignoring ASCII case.
#[derive(Debug, Clone)]
pub struct DomainPattern {
    source: String,
    regex: Regex,
}

impl DomainPattern {
    pub fn new(source: &str) -> Result<Self, RuleError> {
        let regex = RegexBuilder::new(&format!("^(?:{source})$"))
            .case_insensitive(true)
            .build()
            .map_err(|err| RuleError::Pattern {
                pattern: source.to_string(),
                source: err,
            })?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    #[inline]
    pub fn matches(&self, qname: &str) -> bool {
        self.regex.is_match(qname)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// What a single rule decided about a query.
#[derive(Debug)]
pub enum Verdict {
    /// Answer the client with these bytes and stop.
    Respond(Bytes),
    /// Not handled here; try the next rule.
    Pass,
    /// Evaluate the rule set again for this replacement query.
    Rewrite(Query),
}

pub enum Action {
    Redirect {
        destination: Name,
    },
    Block,
    ConditionalBlock {
        record_type: Option<RecordType>,
        record_class: Option<DNSClass>,
    },
    Log,
    Resolve {
        pool: ResolverPool,
    },
    CName {
        destination: Name,
        pool: ResolverPool,
    },
    Rewrite {
        replacement: Name,
    },
}

/// A domain pattern bound to the action taken for matching queries.
///
/// Resolve and CName rules own their resolver pool; it lives and dies with
/// the rule.
pub struct Rule {
    kind: RuleKind,
    domain: DomainPattern,
    action: Action,
}

impl Rule {
    pub fn new(kind: RuleKind, domain: DomainPattern, action: Action) -> Self {
        Self { kind, domain, action }
    }

    /// Builds a rule from parsed definition arguments.
    pub fn from_definition(
        def: &RuleDefinition,
        settings: &Settings,
        transport: &Arc<dyn Transport>,
    ) -> Result<Self, RuleError> {
        let domain = DomainPattern::new(def.require("domain")?)?;
        let pool = |list: &str| -> Result<ResolverPool, RuleError> {
            ResolverPool::new(
                parse_resolvers(list)?,
                settings.resolution_timeout(),
                settings.workers_per_resolver,
                Arc::clone(transport),
            )
        };

        let action = match def.kind {
            RuleKind::Redirect => Action::Redirect {
                destination: fqdn(def.require("destination")?)?,
            },
            RuleKind::Block => Action::Block,
            RuleKind::ConditionalBlock => Action::ConditionalBlock {
                record_type: def.get("type").map(parse_record_type).transpose()?,
                record_class: def.get("class").map(parse_record_class).transpose()?,
            },
            RuleKind::Log => Action::Log,
            RuleKind::Resolve => Action::Resolve {
                pool: pool(def.require("resolvers")?)?,
            },
            RuleKind::CName => Action::CName {
                destination: fqdn(def.require("destination")?)?,
                pool: pool(def.require("resolvers")?)?,
            },
            RuleKind::Rewrite => Action::Rewrite {
                replacement: fqdn(def.require("pattern")?)?,
            },
        };
        debug!(event = "rule_built", kind = %def.kind, domain = %domain.as_str(), "rule compiled");
        Ok(Self::new(def.kind, domain, action))
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    pub fn domain(&self) -> &DomainPattern {
        &self.domain
    }

    #[inline]
    pub fn matches(&self, qname: &str) -> bool {
        self.domain.matches(qname)
    }

    pub async fn dispatch(&self, query: &Query, ctx: &Context) -> Result<Verdict, EvaluateError> {
        match &self.action {
            Action::Redirect { destination } => {
                Ok(Verdict::Respond(response::cname(query, destination)?))
            }
            Action::Block => {
                warn!(
                    event = "block",
                    qname = %query.name(),
                    rule = %self.domain.as_str(),
                    context = %ctx,
                    "blocking query"
                );
                Ok(Verdict::Respond(response::empty_answer(query)?))
            }
            Action::ConditionalBlock {
                record_type,
                record_class,
            } => {
                if record_type.is_some_and(|t| t != query.record_type()) {
                    return Ok(Verdict::Pass);
                }
                if record_class.is_some_and(|c| c != query.record_class()) {
                    return Ok(Verdict::Pass);
                }
                warn!(
                    event = "conditional_block",
                    qname = %query.name(),
                    qtype = %query.record_type(),
                    qclass = %query.record_class(),
                    rule = %self.domain.as_str(),
                    context = %ctx,
                    "conditionally blocking query"
                );
                Ok(Verdict::Respond(response::empty_answer(query)?))
            }
            Action::Log => {
                info!(
                    event = "log",
                    qname = %query.name(),
                    qtype = %query.record_type(),
                    client = ctx.get("client").unwrap_or("-"),
                    rule = %self.domain.as_str(),
                    context = %ctx,
                    "logging query"
                );
                Ok(Verdict::Pass)
            }
            Action::Resolve { pool } => Ok(Verdict::Respond(pool.forward(query).await?)),
            Action::CName { destination, pool } => {
                let lookup_type = match query.record_type() {
                    RecordType::AAAA => RecordType::AAAA,
                    _ => RecordType::A,
                };
                let records = pool.lookup(query, destination, lookup_type).await?;
                let mut msg = response::cname_response(query, destination);
                let appended = response::append_address_records(&mut msg, destination, &records);
                debug!(
                    event = "cname_chain",
                    qname = %query.name(),
                    destination = %destination,
                    addresses = appended,
                    "synthesized cname with addresses"
                );
                Ok(Verdict::Respond(response::encode(&msg)?))
            }
            Action::Rewrite { replacement } => {
                debug!(
                    event = "rewrite",
                    qname = %query.name(),
                    replacement = %replacement,
                    rule = %self.domain.as_str(),
                    "rewriting query name"
                );
                Ok(Verdict::Rewrite(query.rewritten(replacement.clone())))
            }
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule [{}] domain [{}]", self.kind, self.domain.as_str())
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Parses `name` and marks it fully qualified.
pub fn fqdn(name: &str) -> Result<Name, RuleError> {
    let mut parsed = Name::from_str(name.trim()).map_err(|source| RuleError::Name {
        name: name.to_string(),
        source,
    })?;
    parsed.set_fqdn(true);
    Ok(parsed)
}

fn parse_record_type(value: &str) -> Result<RecordType, RuleError> {
    RecordType::from_str(&value.trim().to_ascii_uppercase())
        .map_err(|_| RuleError::RecordType(value.to_string()))
}

fn parse_record_class(value: &str) -> Result<DNSClass, RuleError> {
    DNSClass::from_str(&value.trim().to_ascii_uppercase())
        .map_err(|_| RuleError::RecordClass(value.to_string()))
}

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use arc_swap::ArcSwap;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::{InvalidRulePolicy, Settings};
use crate::error::{EvaluateError, RuleError};
use crate::query::{Context, Query};
use crate::resolver::Transport;
use crate::rule::{Rule, Verdict};
use crate::syntax::parse_rules;

/// Result of running a query through the rule set.
#[derive(Debug)]
pub enum Outcome {
    /// Wire-encoded response for the client.
    Responded(Bytes),
    /// No rule answered; the caller applies its default policy to the
    /// carried query, which reflects every rewrite applied on the way.
    NoAction(Query),
    Failed(EvaluateError),
}

/// Ordered rules. Position breaks ties between overlapping patterns.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Builds a rule set from rules-file text, applying `on_invalid_rule` to
    /// lines that fail to parse or compile.
    pub fn parse(
        text: &str,
        settings: &Settings,
        transport: &Arc<dyn Transport>,
    ) -> Result<Self, RuleError> {
        let mut rules = Vec::new();
        for (line, parsed) in parse_rules(text) {
            let built = parsed.and_then(|def| Rule::from_definition(&def, settings, transport));
            match built {
                Ok(rule) => rules.push(rule),
                Err(err) => {
                    let err = RuleError::Line {
                        line,
                        source: Box::new(err),
                    };
                    if settings.on_invalid_rule == InvalidRulePolicy::Abort {
                        return Err(err);
                    }
                    warn!(target = "rules", error = %err, "skipping invalid rule");
                }
            }
        }
        Ok(Self::new(rules))
    }

    pub fn load(
        path: &Path,
        settings: &Settings,
        transport: &Arc<dyn Transport>,
    ) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read rules file: {}", path.display()))?;
        let rules = Self::parse(&raw, settings, transport)
            .with_context(|| format!("compile rules file: {}", path.display()))?;
        debug!(target = "rules", path = %path.display(), count = rules.len(), "rules loaded");
        Ok(rules)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }
}

/// Runs queries through the current rule set.
///
/// The set sits behind an `ArcSwap` so a reload can replace it while queries
/// are in flight; each evaluation keeps the snapshot it started with.
#[derive(Clone)]
pub struct Engine {
    rules: Arc<ArcSwap<RuleSet>>,
    max_rewrite_depth: usize,
}

impl Engine {
    pub fn new(rules: Arc<ArcSwap<RuleSet>>, max_rewrite_depth: usize) -> Self {
        Self {
            rules,
            max_rewrite_depth,
        }
    }

    pub fn rules(&self) -> &Arc<ArcSwap<RuleSet>> {
        &self.rules
    }

    /// Evaluates `query` against the rule set.
    ///
    /// Rules run in order; the first response wins. A rewrite starts a fresh
    /// pass from the first rule with the rewritten query, and every pass after
    /// `max_rewrite_depth` rewrites is refused with `RewriteLoop`.
    pub async fn evaluate(&self, query: Query, ctx: &Context) -> Outcome {
        let rules = self.rules.load_full();
        let mut query = query;
        let mut depth = 0usize;

        'pass: loop {
            let qname = query.match_name();
            for (idx, rule) in rules.iter().enumerate() {
                if !rule.matches(&qname) {
                    continue;
                }
                let start = Instant::now();
                let verdict = rule.dispatch(&query, ctx).await;
                debug!(
                    event = "dispatch",
                    rule_idx = idx,
                    rule = %rule,
                    qname = %qname,
                    elapsed_us = start.elapsed().as_micros() as u64,
                    "rule dispatched"
                );
                match verdict {
                    Ok(Verdict::Respond(bytes)) => return Outcome::Responded(bytes),
                    Ok(Verdict::Pass) => continue,
                    Ok(Verdict::Rewrite(next)) => {
                        depth += 1;
                        if depth > self.max_rewrite_depth {
                            warn!(
                                event = "rewrite_loop",
                                qname = %next.name(),
                                depth = self.max_rewrite_depth,
                                context = %ctx,
                                "rewrite chain too deep"
                            );
                            return Outcome::Failed(EvaluateError::RewriteLoop {
                                depth: self.max_rewrite_depth,
                                name: next.match_name(),
                            });
                        }
                        query = next;
                        continue 'pass;
                    }
                    Err(err) => return Outcome::Failed(err),
                }
            }
            return Outcome::NoAction(query);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use crate::resolver::testing::{Script, ScriptedTransport};
    use hickory_proto::op::Message;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
    use hickory_proto::serialize::binary::BinDecodable;
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::time::Duration;

    fn engine_with(lines: &[&str], transport: ScriptedTransport) -> Engine {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let settings = Settings {
            resolution_timeout: 0.5,
            on_invalid_rule: InvalidRulePolicy::Abort,
            ..Default::default()
        };
        let rules = RuleSet::parse(&lines.join("\n"), &settings, &transport).expect("build rules");
        Engine::new(Arc::new(ArcSwap::from_pointee(rules)), settings.max_rewrite_depth)
    }

    fn engine(lines: &[&str]) -> Engine {
        engine_with(lines, ScriptedTransport::new())
    }

    fn query(name: &str) -> Query {
        query_typed(name, RecordType::A)
    }

    fn query_typed(name: &str, rtype: RecordType) -> Query {
        Query::new(1234, Name::from_str(name).unwrap(), rtype, DNSClass::IN)
    }

    fn responded(outcome: Outcome) -> Message {
        match outcome {
            Outcome::Responded(bytes) => Message::from_bytes(&bytes).expect("decode response"),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn block_scenario() {
        let engine = engine(&["block bad.example"]);
        let ctx = Context::new();

        let q = query("bad.example.");
        let msg = responded(engine.evaluate(q.clone(), &ctx).await);
        assert!(msg.answers().is_empty());
        assert_eq!(msg.id(), 1234);
        assert_eq!(msg.queries(), q.message().queries());

        assert!(matches!(
            engine.evaluate(query("good.example."), &ctx).await,
            Outcome::NoAction(_)
        ));
    }

    #[tokio::test]
    async fn redirect_scenario() {
        let engine = engine(&[r"redirect ^www\.foo\.com$ to foo.com"]);
        let msg = responded(engine.evaluate(query("www.foo.com."), &Context::new()).await);
        assert_eq!(msg.answers().len(), 1);
        assert_eq!(msg.answers()[0].name().to_ascii(), "www.foo.com.");
        match msg.answers()[0].data() {
            Some(RData::CNAME(target)) => assert_eq!(target.0.to_ascii(), "foo.com."),
            other => panic!("expected CNAME, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn matching_is_case_insensitive() {
        let engine = engine(&["block bad.example"]);
        let outcome = engine.evaluate(query("BAD.Example."), &Context::new()).await;
        assert!(matches!(outcome, Outcome::Responded(_)));
    }

    #[tokio::test]
    async fn first_responding_rule_wins_in_order() {
        let engine = engine(&[
            "log .*",
            r"block ^(.*)\.example if type is MX",
            r"redirect ^(.*)\.example to first.test",
            r"redirect ^(.*)\.example to second.test",
        ]);
        let msg = responded(engine.evaluate(query("a.example."), &Context::new()).await);
        match msg.answers()[0].data() {
            Some(RData::CNAME(target)) => assert_eq!(target.0.to_ascii(), "first.test."),
            other => panic!("expected CNAME, got {other:?}"),
        }

        let msg = responded(
            engine
                .evaluate(query_typed("a.example.", RecordType::MX), &Context::new())
                .await,
        );
        assert!(msg.answers().is_empty());
    }

    #[tokio::test]
    async fn rewrite_reevaluates_against_new_name() {
        let engine = engine(&[
            r"block ^google\.com$",
            r"rewrite ^www\.google\.com$ to google.com",
        ]);
        let msg = responded(engine.evaluate(query("www.google.com."), &Context::new()).await);
        assert!(msg.answers().is_empty());
        assert_eq!(msg.queries()[0].name().to_ascii(), "google.com.");
    }

    #[tokio::test]
    async fn rewrite_without_follow_up_hands_back_rewritten_query() {
        let engine = engine(&["log .*", r"rewrite ^www\.google\.com$ to google.com"]);
        let original = query("www.google.com.");
        match engine.evaluate(original.clone(), &Context::new()).await {
            Outcome::NoAction(next) => {
                assert_eq!(next.name().to_ascii(), "google.com.");
                assert_eq!(next.id(), original.id());
                assert_eq!(next.record_type(), RecordType::A);
            }
            other => panic!("expected no action, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn untouched_query_is_handed_back_as_is() {
        let engine = engine(&["log .*"]);
        match engine.evaluate(query("plain.example."), &Context::new()).await {
            Outcome::NoAction(next) => assert_eq!(next.name().to_ascii(), "plain.example."),
            other => panic!("expected no action, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn self_rewrite_terminates_with_loop_error() {
        let engine = engine(&["rewrite a to a"]);
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            engine.evaluate(query("a."), &Context::new()),
        )
        .await
        .expect("evaluation must terminate");
        match outcome {
            Outcome::Failed(EvaluateError::RewriteLoop { depth, name }) => {
                assert_eq!(depth, 5);
                assert_eq!(name, "a");
            }
            other => panic!("expected rewrite loop, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rewrite_chain_within_depth_succeeds() {
        let engine = engine(&[
            "rewrite a to b",
            "rewrite b to c",
            "rewrite c to d",
            "block d",
        ]);
        let msg = responded(engine.evaluate(query("a."), &Context::new()).await);
        assert_eq!(msg.queries()[0].name().to_ascii(), "d.");
    }

    #[tokio::test]
    async fn network_failure_aborts_pass() {
        let transport = ScriptedTransport::new()
            .with(
                "10.9.9.1",
                Script::Answer {
                    delay: Duration::from_millis(200),
                    records: Vec::new(),
                },
            )
            .with("10.9.9.2", Script::Fail { delay: Duration::from_millis(1) });
        let engine = engine_with(
            &["resolve .* using 10.9.9.1, 10.9.9.2", "block .*"],
            transport,
        );
        match engine.evaluate(query("x.example."), &Context::new()).await {
            Outcome::Failed(EvaluateError::Network(err)) => {
                assert!(matches!(err.cause, UpstreamError::Io(_)));
                assert_eq!(err.query.match_name(), "x.example");
            }
            other => panic!("expected network failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_answer_passes_through() {
        let record = Record::from_rdata(
            Name::from_str("x.example.").unwrap(),
            77,
            RData::A(A(Ipv4Addr::new(10, 0, 0, 7))),
        );
        let transport = ScriptedTransport::new()
            .with(
                "10.9.9.1",
                Script::Answer {
                    delay: Duration::from_millis(1),
                    records: vec![record],
                },
            );
        let engine = engine_with(&["log .*", "resolve .* using 10.9.9.1"], transport);
        let msg = responded(engine.evaluate(query("x.example."), &Context::new()).await);
        assert_eq!(msg.answers()[0].ttl(), 77);
    }

    #[tokio::test]
    async fn reload_swaps_rules_for_new_queries() {
        let engine = engine(&["block bad.example"]);
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::new());
        let replacement = RuleSet::parse("log .*\n", &Settings::default(), &transport).unwrap();
        engine.rules().store(Arc::new(replacement));

        let outcome = engine.evaluate(query("bad.example."), &Context::new()).await;
        assert!(matches!(outcome, Outcome::NoAction(_)));
    }

    #[test]
    fn parse_skips_or_aborts_on_invalid_lines() {
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::new());
        let text = "block bad.example\nfrobnicate everything\nredirect (broken to x.com\nlog .*\n";

        let skipped = RuleSet::parse(text, &Settings::default(), &transport).unwrap();
        assert_eq!(skipped.len(), 2);

        let strict = Settings {
            on_invalid_rule: InvalidRulePolicy::Abort,
            ..Default::default()
        };
        match RuleSet::parse(text, &strict, &transport) {
            Err(RuleError::Line { line, source }) => {
                assert_eq!(line, 2);
                assert!(matches!(*source, RuleError::NoMatch(_)));
            }
            other => panic!("expected line error, got {other:?}"),
        }
    }
}

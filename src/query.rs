use std::collections::BTreeMap;
use std::fmt;

use hickory_proto::op::{Message, MessageType, Query as Question};
use hickory_proto::rr::{DNSClass, Name, RecordType};

/// A decoded inbound request with exactly one question taken as its subject.
///
/// Rewrites never touch an existing value: [`Query::rewritten`] hands back a
/// new query carrying the replacement name.
#[derive(Debug, Clone)]
pub struct Query {
    message: Message,
}

impl Query {
    /// Wraps a decoded message. Returns `None` when it carries no question.
    pub fn from_message(message: Message) -> Option<Self> {
        if message.queries().is_empty() {
            return None;
        }
        Some(Self { message })
    }

    /// Builds a fresh recursive query, used for upstream lookups and tests.
    pub fn new(id: u16, name: Name, record_type: RecordType, record_class: DNSClass) -> Self {
        let mut question = Question::query(name, record_type);
        question.set_query_class(record_class);
        let mut message = Message::new();
        message.set_id(id);
        message.set_message_type(MessageType::Query);
        message.set_recursion_desired(true);
        message.add_query(question);
        Self { message }
    }

    #[inline]
    pub fn question(&self) -> &Question {
        &self.message.queries()[0]
    }

    #[inline]
    pub fn name(&self) -> &Name {
        self.question().name()
    }

    #[inline]
    pub fn record_type(&self) -> RecordType {
        self.question().query_type()
    }

    #[inline]
    pub fn record_class(&self) -> DNSClass {
        self.question().query_class()
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.message.id()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Question name as matched by rule patterns: no trailing root dot.
    pub fn match_name(&self) -> String {
        let mut text = self.name().to_ascii();
        if text.ends_with('.') {
            text.pop();
        }
        text
    }

    pub fn rewritten(&self, name: Name) -> Query {
        let mut message = self.message.clone();
        let mut questions = message.take_queries();
        questions[0].set_name(name);
        message.add_queries(questions);
        Query { message }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id {} {} {} {}",
            self.id(),
            self.name(),
            self.record_class(),
            self.record_type()
        )
    }
}

/// Diagnostic key/value pairs carried through a dispatch for log correlation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context(BTreeMap<String, String>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (idx, (k, v)) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}: {v}")?;
        }
        f.write_str("}")
    }
}

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::RuleError;

/// Rule variants of the definition language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Redirect,
    CName,
    ConditionalBlock,
    Block,
    Log,
    Resolve,
    Rewrite,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleKind::Redirect => "redirect",
            RuleKind::CName => "cname",
            RuleKind::ConditionalBlock => "conditional_block",
            RuleKind::Block => "block",
            RuleKind::Log => "log",
            RuleKind::Resolve => "resolve",
            RuleKind::Rewrite => "rewrite",
        })
    }
}

/// One parsed line: which variant, plus the named fields it captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDefinition {
    pub kind: RuleKind,
    pub args: HashMap<String, String>,
}

impl RuleDefinition {
    pub fn new<K, V>(kind: RuleKind, args: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            kind,
            args: args
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &'static str) -> Result<&str, RuleError> {
        self.get(key).ok_or(RuleError::MissingArgument(key))
    }
}

// Order matters: conditional block lines also match the plain block pattern.
static SYNTAX: LazyLock<Vec<(RuleKind, Regex)>> = LazyLock::new(|| {
    let table: [(RuleKind, &str); 9] = [
        // redirect ^(.*)google.com to nytimes.com
        (RuleKind::Redirect, r"^redirect (?P<domain>.*) to (?P<destination>.*)$"),
        // cname ^(.*)google.com to nytimes.com using 8.8.8.8, 8.8.4.4
        (
            RuleKind::CName,
            r"^cname (?P<domain>.*) to (?P<destination>.*) using (?P<resolvers>.*)$",
        ),
        // block ^(.*).xxx if type is MX and class is ANY
        (
            RuleKind::ConditionalBlock,
            r"^block (?P<domain>.*) if type is (?P<type>.*) and class is (?P<class>.*)$",
        ),
        // block ^(.*).xxx if type is TXT
        (
            RuleKind::ConditionalBlock,
            r"^block (?P<domain>.*) if type is (?P<type>.*)$",
        ),
        // block ^(.*).xxx if class is ANY
        (
            RuleKind::ConditionalBlock,
            r"^block (?P<domain>.*) if class is (?P<class>.*)$",
        ),
        (RuleKind::Block, r"^block (?P<domain>.*)$"),
        (RuleKind::Log, r"^log (?P<domain>.*)$"),
        // resolve ^(.*)example using 8.8.4.4, 8.8.8.8
        (RuleKind::Resolve, r"^resolve (?P<domain>.*) using (?P<resolvers>.*)$"),
        // rewrite ^www.google.com to google.com
        (RuleKind::Rewrite, r"^rewrite (?P<domain>.*) to (?P<pattern>.*)$"),
    ];
    table
        .into_iter()
        .map(|(kind, re)| (kind, Regex::new(re).expect("static rule syntax")))
        .collect()
});

/// Parses a single rule line. Surrounding whitespace is ignored.
pub fn parse_line(line: &str) -> Result<RuleDefinition, RuleError> {
    let line = line.trim();
    for (kind, re) in SYNTAX.iter() {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let args = re
            .capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name, m.as_str().trim())))
            .collect::<Vec<_>>();
        return Ok(RuleDefinition::new(*kind, args));
    }
    Err(RuleError::NoMatch(line.to_string()))
}

/// Parses a rules file. Blank lines and `#` comments are skipped; every
/// other line yields its 1-based line number and the parse result.
pub fn parse_rules(
    text: &str,
) -> impl Iterator<Item = (usize, Result<RuleDefinition, RuleError>)> + '_ {
    text.lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(line_no, line)| (line_no, parse_line(line)))
}

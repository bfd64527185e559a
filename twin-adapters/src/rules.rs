//! Deterministic keyword-based selector.
//!
//! The rules provider needs no network and no credentials, which makes it
//! the default for integration tests, demos, and plants that cannot reach a
//! hosted model.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use twin_primitives::ToolSchema;

use crate::traits::{AdapterResult, SelectedCall, SelectorMetadata, ToolSelector};

/// One keyword rule mapping message content to a tool call.
#[derive(Clone, Debug)]
pub struct SelectionRule {
    tool: String,
    keywords: Vec<String>,
    number_argument: Option<String>,
    quoted_argument: Option<String>,
    fixed_arguments: Map<String, Value>,
}

impl SelectionRule {
    /// Creates a rule producing calls to the named tool.
    #[must_use]
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            keywords: Vec::new(),
            number_argument: None,
            quoted_argument: None,
            fixed_arguments: Map::new(),
        }
    }

    /// Adds trigger keywords; the rule fires when any appears in the
    /// message (case-insensitive).
    #[must_use]
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords
            .extend(keywords.into_iter().map(|keyword| keyword.into().to_lowercase()));
        self
    }

    /// Captures the first number in the message into the named argument.
    #[must_use]
    pub fn with_number_argument(mut self, name: impl Into<String>) -> Self {
        self.number_argument = Some(name.into());
        self
    }

    /// Captures the first single- or double-quoted string in the message
    /// into the named argument.
    #[must_use]
    pub fn with_quoted_argument(mut self, name: impl Into<String>) -> Self {
        self.quoted_argument = Some(name.into());
        self
    }

    /// Adds a fixed argument included in every produced call.
    #[must_use]
    pub fn with_fixed_argument(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fixed_arguments.insert(name.into(), value);
        self
    }

    fn matches(&self, lowered: &str) -> bool {
        !self.keywords.is_empty() && self.keywords.iter().any(|keyword| lowered.contains(keyword))
    }

    fn build_call(&self, message: &str) -> SelectedCall {
        let mut arguments = self.fixed_arguments.clone();
        if let Some(name) = &self.number_argument {
            if let Some(number) = first_number(message) {
                arguments.insert(name.clone(), number);
            }
        }
        if let Some(name) = &self.quoted_argument {
            if let Some(text) = first_quoted(message) {
                arguments.insert(name.clone(), Value::from(text));
            }
        }
        SelectedCall::new(self.tool.clone(), Value::Object(arguments))
    }
}

/// Extracts the first numeric token from the message.
fn first_number(message: &str) -> Option<Value> {
    let mut start = None;
    let bytes = message.as_bytes();
    for (index, byte) in bytes.iter().enumerate() {
        let part_of_number =
            byte.is_ascii_digit() || (*byte == b'.' && start.is_some()) || (*byte == b'-' && start.is_none() && bytes.get(index + 1).is_some_and(u8::is_ascii_digit));
        match (part_of_number, start) {
            (true, None) => start = Some(index),
            (false, Some(from)) => return parse_number(&message[from..index]),
            _ => {}
        }
    }
    start.and_then(|from| parse_number(&message[from..]))
}

fn parse_number(token: &str) -> Option<Value> {
    if let Ok(integer) = token.parse::<i64>() {
        return Some(Value::from(integer));
    }
    token.parse::<f64>().ok().and_then(|float| {
        serde_json::Number::from_f64(float).map(Value::Number)
    })
}

/// Extracts the first quoted substring, honouring whichever quote character
/// opens first and requiring a matching closer.
fn first_quoted(message: &str) -> Option<String> {
    let open = message.find(|c| c == '"' || c == '\'')?;
    let quote = message[open..].chars().next()?;
    let rest = &message[open + quote.len_utf8()..];
    let close = rest.find(quote)?;
    let inner = &rest[..close];
    (!inner.is_empty()).then(|| inner.to_owned())
}

/// Keyword-matching selector evaluated in rule order.
pub struct RulesSelector {
    metadata: SelectorMetadata,
    rules: Vec<SelectionRule>,
}

impl RulesSelector {
    /// Creates a selector over the supplied rules.
    #[must_use]
    pub fn new(rules: Vec<SelectionRule>) -> Self {
        Self {
            metadata: SelectorMetadata::new("rules", "keyword-v1"),
            rules,
        }
    }
}

#[async_trait]
impl ToolSelector for RulesSelector {
    fn metadata(&self) -> &SelectorMetadata {
        &self.metadata
    }

    async fn select(
        &self,
        message: &str,
        catalog: &[ToolSchema],
    ) -> AdapterResult<Vec<SelectedCall>> {
        let lowered = message.to_lowercase();
        let calls: Vec<SelectedCall> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(&lowered))
            .filter(|rule| catalog.iter().any(|schema| schema.name() == rule.tool))
            .map(|rule| rule.build_call(message))
            .collect();

        debug!(message, count = calls.len(), "rules selection complete");
        Ok(calls)
    }
}

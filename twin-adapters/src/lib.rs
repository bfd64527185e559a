//! Tool-selector adapters.
//!
//! A selector maps an operator's natural-language message plus the tool
//! catalog to zero or more candidate calls. The deterministic rules
//! selector covers tests and air-gapped plants; the Anthropic and OpenAI
//! selectors use the providers' tool-use APIs.

#![warn(missing_docs, clippy::pedantic)]

mod anthropic;
mod openai;
mod rules;
pub mod traits;

pub use anthropic::{AnthropicSelector, AnthropicSelectorConfig};
pub use openai::{OpenAiSelector, OpenAiSelectorConfig};
pub use rules::{RulesSelector, SelectionRule};
pub use traits::{
    AdapterError, AdapterResult, SelectedCall, SelectorLimiter, SelectorMetadata, ToolSelector,
};

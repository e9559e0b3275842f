//! LLM provider abstraction: a uniform async request/response surface over
//! heterogeneous vendors, plus the router that multiplexes between them.

mod anthropic;
mod ollama;
mod openai;
mod provider;
mod router;
mod schemas;
mod scripted;

pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use provider::{Provider, ProviderError};
pub use router::ProviderRouter;
pub use schemas::validate_structured;
pub use scripted::{ScriptedProvider, ScriptedReply};

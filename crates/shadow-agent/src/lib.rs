pub mod anthropic;
pub mod sse;
pub mod toolspec;

pub use anthropic::AnthropicClient;

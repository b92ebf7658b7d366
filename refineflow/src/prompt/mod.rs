//! Prompt template loading and rendering.

mod template;

pub use template::PromptTemplate;

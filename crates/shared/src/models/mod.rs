pub mod llm;
pub mod node;
pub mod usage;

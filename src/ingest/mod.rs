pub mod directions;
pub mod llm;

pub mod budget;
pub mod llm;
pub mod ocr;
pub mod pdf;
pub mod scheduler;
pub mod stages;

pub use budget::LlmBudget;
pub use llm::{Claude, Completion, CompletionRequest, LanguageModel};
pub use scheduler::Scheduler;

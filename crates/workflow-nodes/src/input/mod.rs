//! Input nodes
//!
//! Entry points of a (sub-)workflow and interactive questions.

mod question_answer;
mod start;

pub use question_answer::{AnswerOption, QuestionAnswerNode};
pub use start::StartNode;

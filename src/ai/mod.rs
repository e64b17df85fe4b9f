pub mod gateway;
mod knowledge;
mod persona;

pub use gateway::{gateway_from_config, AiGateway, AnswerResult};
pub use knowledge::LocalKnowledgeBase;
#[cfg(test)]
pub use knowledge::QaPair;

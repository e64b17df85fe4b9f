mod chat;
mod queue;
mod scan;

pub use chat::*;
pub use queue::*;
pub use scan::*;

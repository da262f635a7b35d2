pub mod scheduler;
pub mod store;

pub use scheduler::{SchedulerHandle, SummaryScheduler};
pub use store::{ConversationMeta, MemoryError, MemoryStore, NewTurn, Summary, TurnRecord};

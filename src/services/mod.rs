pub mod admin;
pub mod analyzer;
pub mod grants;
pub mod memory;
pub mod notifier;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod state;
pub mod storage;
pub mod worker;

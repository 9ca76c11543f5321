// 本地持久化模块

pub mod accounts;
pub mod shared_store;

pub use accounts::{Account, AccountManager};
pub use shared_store::{SharedLinkRecord, SharedStore};

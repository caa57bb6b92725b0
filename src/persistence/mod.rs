//! Persistence - Engine settings, bot profiles and the script library

mod database;
mod scripts;

pub use database::Database;
pub use scripts::{ScriptStore, StoreError};

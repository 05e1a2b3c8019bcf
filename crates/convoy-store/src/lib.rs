pub mod chat_store;
pub mod conversations;
pub mod database;
pub mod directory;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;

pub use chat_store::{ChatStore, SqliteChatStore};
pub use database::Database;
pub use error::StoreError;
pub use messages::StoredMessage;

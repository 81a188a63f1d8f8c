pub mod adapter;
pub mod database;
pub mod drives;
pub mod error;
pub mod login_sessions;
pub mod row_helpers;
pub mod schema;
pub mod telemetry;
pub mod users;

pub use adapter::SqliteStore;
pub use database::Database;
pub use error::StoreError;

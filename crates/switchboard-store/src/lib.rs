mod columns;
pub mod contacts;
pub mod database;
pub mod error;
pub mod instances;
pub mod messages;
pub mod schema;
pub mod sealing;
pub mod stats;

pub use database::Database;
pub use error::StoreError;

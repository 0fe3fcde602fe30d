pub mod database;
pub mod query;

pub use database::AppState;

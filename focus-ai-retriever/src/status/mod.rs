// Status API modules
pub mod api;
pub mod database;
pub mod types;


// Re-export all public types for easy access
pub use api::*;
pub use database::*;
pub use types::*;

pub mod db;
pub mod error;
pub mod gateway;

pub use error::{Result, StoreError};
pub use gateway::{cache_key, StoreGateway};

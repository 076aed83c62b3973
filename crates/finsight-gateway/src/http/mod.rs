pub mod admin;
pub mod analyses;
pub mod common;
pub mod health;
pub mod sessions;
pub mod stream;
pub mod submit;

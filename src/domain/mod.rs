pub mod models;
pub mod origin;

pub mod admin;
pub mod auth;
pub mod categories;
pub mod chunks;
pub mod export;
pub mod files;
pub mod folders;
pub mod health;
pub mod share;
pub mod storage;
pub mod trash;

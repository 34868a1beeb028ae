pub mod admin;
pub mod auth;
pub mod category;
pub mod chunks;
pub mod export;
pub mod files;
pub mod folders;
pub mod shared;
pub mod storage;

mod auth;
mod chunks;
mod common;
mod export;
mod files;
mod namespace;
mod trash_gc;

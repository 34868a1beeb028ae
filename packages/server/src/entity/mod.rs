pub mod blob;
pub mod category;
pub mod export_job;
pub mod file_entry;
pub mod registration_request;
pub mod share_link;
pub mod upload_session;
pub mod user;

pub mod blob_store;
pub mod sweeper;
pub mod upload_service;

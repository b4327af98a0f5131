//! Backup: exports the database, the dataroot and the file store, and uploads
//! each archive to the remote store.

pub mod dataroot;
pub mod db_export;
pub mod documents;
mod logic;

pub use logic::{execute, operator_details, origin_metadata, schedule};

//! Restore: downloads a backup, checks it against this site, then replaces the
//! database, the dataroot and the file store with its content.

pub mod dataroot;
pub mod db_restore;
mod logic;
pub mod structure;
pub mod upgrade;

pub use logic::{ensure_registered, execute, schedule};

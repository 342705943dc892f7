//! # Persistence Module
//!
//! State that has to survive a daemon restart. Today that is only the
//! recently-launched list; configuration is read-only and lives in [`crate::config`].
//!
//! Missing or corrupted files degrade to an empty state with a warning, they
//! never keep the daemon from starting. Writes go to a temporary file first and
//! are renamed into place, so a crash mid-write leaves the previous file intact.

pub mod recent;

pub use recent::RecentList;

//! Core data model shared by the transfer engine and the listing cache.
//!
//! Transfer records map to database rows via `sqlx::FromRow`; listing
//! entries are plain values handed to listing consumers. Everything
//! serializes via `serde`.

pub mod multipart;
pub mod object;
pub mod transfer;

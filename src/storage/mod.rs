//! Storage Accountant (C2): per-volume free/reserved/available byte
//! reporting, watermark enforcement, and pre-flight required-bytes checks.

pub mod current_target;
pub mod db;
pub mod stat;

pub use stat::{StorageAccountant, StorageUsage};

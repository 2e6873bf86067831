//! The concurrent backup pipeline: scanner → hasher pool → bucketer →
//! uploader pool, coordinated through the size-claim and hash-late maps and
//! a shared in-flight counter.

pub mod bucketer;
pub mod claims;
pub mod hasher;
pub mod latecomers;
pub mod orchestrator;
pub mod scanner;
pub mod session;
pub mod uploader;

pub use claims::SizeClaimMap;
pub use latecomers::{HashLateMap, LateDecision};
pub use orchestrator::{RunSummary, run_backup};
pub use scanner::{catalog_key, excluded_by_rules};
pub use session::{BackupSession, InflightCounter, RunStats};

// src/git/mod.rs

//! Git object store access and serialized store mutations

pub mod ops;
pub mod store;

pub use ops::{create_critical_git_op_map, CriticalGitOpMap, GitOpKey, GitOpType, GitOpValue};
pub use store::{GitCas, ObjectKind, TreeEntries};

pub mod git;

pub use git::{BRANCH_PREFIX, GitTracker};

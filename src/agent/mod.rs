pub mod compaction;
pub mod environment;
pub mod rlm;
pub mod spawner;
pub mod tools;
pub mod truncation;
pub mod usage;

pub use rlm::{Outcome, Rlm, RlmResult, Task};

//! Judge engine for a coding-practice platform
//!
//! Compiles a submission once, runs it against a problem's test cases in a
//! sandbox with time and memory ceilings, and reduces the outcomes to a single
//! [`verdict::StatusCode`], stopping at the first failing test case.

pub mod comparator;
pub mod compiler;
pub mod config;
pub mod error;
pub mod judger;
pub mod languages;
pub mod pool;
pub mod problem;
pub mod runtime;
pub mod sandbox;
pub mod verdict;

pub use config::JudgeConfig;
pub use error::{JudgeError, JudgeOutcome};
pub use judger::{JudgeEngine, JudgeRequest, JudgeResult};
pub use pool::JudgePool;
pub use problem::{FsProblemRepository, InMemoryProblemRepository, Problem, ProblemRepository, TestCase};
pub use verdict::StatusCode;

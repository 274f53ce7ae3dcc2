//! In-memory vendor doubles and the shared adapter contract suite.

pub mod cloud;
pub mod contract;
pub mod machine;

pub use cloud::FakeCloud;
pub use contract::{Capabilities, run_contract_suite};
pub use machine::FakeMachine;

//! Test fixtures for running scenarios against the stack under test.

pub mod stack;

pub use stack::{assert_passed, StackFixture};

//! Testing utilities for deterministic engine tests.

pub mod scripted_runner;

pub use scripted_runner::{ScriptedRunner, TaskScript};

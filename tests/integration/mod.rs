//! Integration test suite for overseer.
//!
//! These tests exercise the full workflow from plan generation to
//! completion: planning, approval, sequential subtask execution, phase
//! advancement, and teardown. They verify that the engine's components
//! work together correctly.
//!
//! # CI Compatibility
//!
//! All agent runs use the scripted capability adapter; no real agent
//! processes are spawned, making these safe to run in CI environments.

mod fixtures;

mod workflow_e2e;
mod concurrency;

//! Scenario-based tests for the orchestrator

mod helpers;

mod cancellation;
mod concurrency;
mod conditions;
mod failure_handling;
mod lifecycle;
mod retry_behavior;
mod success_chain;
mod timeouts;

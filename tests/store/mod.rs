//! Shared store integration tests.
//!
//! Tests the EventStore contract against every backend. Each backend test
//! binary imports this module and runs `run_store_contract_tests!`.

pub mod contract_tests;

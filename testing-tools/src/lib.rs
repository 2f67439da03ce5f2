// Testing Tools Library
//
// This crate provides integration testing utilities for the HomeCon sync client.
// Currently includes:
// - sync-test-client: runs subscription scenarios against a live backend

pub mod output;
pub mod scenarios;

//! Shared fixtures for the Skein integration tests

pub mod fixtures;
pub mod test_helpers;

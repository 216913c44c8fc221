//! Integration tests for tumblr-update
//!
//! These run whole passes against wiremock servers standing in for the read
//! API and the media hosts.

mod pipeline_tests;

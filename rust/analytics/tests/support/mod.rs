#![allow(dead_code)]

pub mod harness;
pub mod stub;

pub use harness::{read_json, with_pg_harness, TestApp, API_KEY};
pub use stub::{stub_app, StubExecutor};

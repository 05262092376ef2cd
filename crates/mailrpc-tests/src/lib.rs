//! mailrpc test and validation infrastructure
//!
//! Loopback harness plus cross-module tests that run real clients and
//! listeners over TCP on 127.0.0.1.

pub mod harness;
pub mod proptest_codec;
pub mod protocol_tests;
pub mod scenario_tests;

pub use harness::{
    chat_index, descriptor, init_tracing, start_chat_server, start_server, ChatHandler, RawPeer,
};

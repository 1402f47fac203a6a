//! Turns a description or a face photo into a Minecraft or Funko Pop character image,
//! publishes it and hands back a scan code for the link.

#![allow(clippy::multiple_crate_versions)]
#![deny(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::complexity)]
#![deny(clippy::correctness)]
#![deny(clippy::disallowed_methods)]
#![deny(clippy::expect_used)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::panic)]
#![deny(clippy::perf)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::unreachable)]
#![deny(clippy::unwrap_used)]
#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(
    test,
    allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)
)]

pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod frame;
pub mod generation;
pub mod http;
pub mod prompt;
pub mod scancode;
pub mod storage;
pub mod vision;
pub mod web;
pub mod workflow;

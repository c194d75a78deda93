//! Armitage — outbound notification dispatch.
//!
//! Single Rust binary. Accepts send requests for SMS/chat messages, drives
//! them to a terminal delivery state through an external provider bridge,
//! reconciles asynchronous webhook status callbacks, and manages the
//! approval lifecycle of reusable message templates.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod store;

pub mod message;
pub mod template;

pub mod provider;
pub mod service;

pub mod dispatch;
pub mod webhook;

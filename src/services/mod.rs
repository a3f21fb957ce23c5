//! Domain services used by the websocket route and the in-process transport.
//!
//! ARCHITECTURE
//! ============
//! Service modules own room lifecycle, access checks, and snapshot
//! persistence so route handlers can stay focused on protocol translation.

pub mod access;
pub mod persistence;
pub mod room;

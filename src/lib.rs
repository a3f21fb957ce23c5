//! stackboard: collaborative board replication engine.
//!
//! ARCHITECTURE
//! ============
//! - `doc`: the replicated document (entities, change reducer, selection
//!   overlay, convergent collections, store), presence roster, roadmap diff.
//! - `session`: the client side of one room over a `transport`.
//! - `services` + `routes`: the room hub, its access and snapshot
//!   collaborators, and the websocket surface.

pub mod config;
pub mod db;
pub mod doc;
pub mod frame;
pub mod routes;
pub mod services;
pub mod session;
pub mod state;
pub mod transport;

//! Types shared between the edge relay and the ingest server.
pub mod wire;

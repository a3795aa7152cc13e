//! Purpose: Library crate behind the `patient-query` CLI and HTTP server.
//! Exports: `core` (record model, store, query engine, errors), `data_source`, `api`.
//! Role: Holds all query semantics; binaries only parse input and render output.
//! Invariants: The store is built once and never mutated by any operation.
//! Invariants: Core modules take the store as an explicit input, never from global state.
pub mod api;
pub mod core;
pub mod data_source;

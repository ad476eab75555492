//! Purpose: Holdings change log ("phlog") library used by the `phlog` CLI and tests.
//! Exports: `api` (repository, cursor, migrator, errors), `core` (storage internals), `notice`.
//! Role: Records modification/deletion events per (agency, record) and serves
//! bounded-memory reads over half-open modification-time windows.
//! Invariants: Modification times are assigned by the store, never by callers.
//! Invariants: Range reads buffer at most one page of decoded rows.
pub mod api;
pub mod core;
pub mod notice;

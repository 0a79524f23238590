//! Engine cache integration tests
//!
//! - `concurrency`: one engine per path under concurrent acquirers, creation timeouts
//! - `eviction`: idle eviction, grace resets, seal failures
//! - `recovery`: start-up from every crash state, tampered ciphertext

mod concurrency;
mod recovery;

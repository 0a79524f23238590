/*! Integration tests for Lockbox.
 *
 * This test suite is organized as a single integration test binary
 * following the pattern described by matklad in
 * https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 *
 * The module structure mirrors the main library structure:
 * - cipher: Chunked file encryption over real files, tamper detection
 * - migration: Schema runner against bare pools and through the cache
 * - engine: Engine cache concurrency, idle eviction and crash recovery
 * - accounts: Registration, tokens, keyring and database key rotation
 */

use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("lockbox=info".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

mod cipher;
mod engine;
mod helpers;
mod migration;

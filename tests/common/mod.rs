// Shared test support. Lives under `tests/common/` (not `tests/common.rs`)
// so cargo doesn't treat it as its own test binary.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a `tracing_subscriber` fmt layer routed through the test
/// harness's captured output, mirroring the teacher's
/// `tracing_subscriber::fmt::init()` call in `main.rs`. Safe to call from
/// every test; only the first call in a given test binary installs the
/// subscriber.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .try_init();
    });
}

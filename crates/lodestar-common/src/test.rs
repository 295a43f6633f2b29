use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

/// Create a fresh, empty directory under the system temp dir.
///
/// Names combine the prefix, process id and a counter, so parallel tests
/// never share a directory.
pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "lodestar-{prefix}-{}-{n}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    let _ = std::fs::create_dir_all(&dir);
    dir
}

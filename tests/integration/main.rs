//! Crucible integration harness.
//!
//! Tests here drive real subprocesses end to end through the dispatcher.
//! Scripts are small POSIX shell programs written to a per-test tempdir
//! and launched with `interpreter = "sh"`; each gets the standard
//! `--id / --input-pipe / --output-pipe` argument vector, so the input
//! pipe is `$4` and the output pipe is `$6`.

mod cancel;
mod lifecycle;

use std::sync::Arc;
use std::sync::Once;

use crucible_core::config::CrucibleConfig;
use crucible_engine::{MemoryCache, TaskDispatcher};

pub const ECHO: &str = "echo.sh";
pub const FAIL: &str = "fail.sh";
pub const SLOW: &str = "slow.sh";

/// Reads one frame; fails on payloads mentioning should_fail, otherwise
/// echoes the frame back. Mirrors the classic echo-worker contract.
const ECHO_SCRIPT: &str = r#"IFS= read -r line < "$4"
case "$line" in
  *should_fail*) echo "failing as requested" >&2; exit 1 ;;
esac
echo "echoing one frame"
printf '%s\n' "$line" > "$6"
"#;

/// Reads one frame, complains, and exits non-zero without responding.
const FAIL_SCRIPT: &str = r#"IFS= read -r _ < "$4"
echo "this task always fails" >&2
exit 1
"#;

/// Reads one frame and then stalls long enough to be cancelled. `exec` so
/// the signalled pid is the stalling process itself.
const SLOW_SCRIPT: &str = r#"IFS= read -r _ < "$4"
exec sleep 300
"#;

pub fn init_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One dispatcher over a fresh tempdir with the standard scripts installed.
pub struct TestBed {
    // Held for its Drop: removes scripts and pipes.
    _dir: tempfile::TempDir,
    pub dispatcher: Arc<TaskDispatcher>,
}

pub fn testbed() -> TestBed {
    init_tracing();

    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = CrucibleConfig::default();
    config.scripts.script_dir = dir.path().join("scripts");
    config.scripts.interpreter = "sh".to_string();
    config.engine.pipe_dir = dir.path().join("pipes");
    config.engine.kill_grace_secs = 2;
    config.engine.claim_poll_ms = 10;

    std::fs::create_dir_all(&config.scripts.script_dir).expect("script dir");
    for (name, body) in [(ECHO, ECHO_SCRIPT), (FAIL, FAIL_SCRIPT), (SLOW, SLOW_SCRIPT)] {
        std::fs::write(config.scripts.script_dir.join(name), body).expect("write script");
    }

    let dispatcher = Arc::new(TaskDispatcher::new(config, Arc::new(MemoryCache::new())));
    TestBed {
        _dir: dir,
        dispatcher,
    }
}

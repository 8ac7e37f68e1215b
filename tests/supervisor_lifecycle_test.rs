//! Drives a real child process through the Supervisor's start/shutdown
//! handshake. Uses `python3` as a stand-in child that speaks the
//! `[u32 LE length][JSON]` IPC framing, rather than this crate's own
//! binary, so the test doesn't depend on a build step having run.
//!
//! Skips (rather than fails) when `python3` isn't on `PATH`, mirroring
//! the prerequisite-guarded skip used for subprocess tests elsewhere.

use std::process::Command;

use stationhub::supervisor::{ChildCommand, Supervisor, SupervisorState};

fn python3_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// A tiny child that writes a `ready` IPC frame, then waits for a
/// `drain` frame before replying `drain_complete` and exiting.
const CHILD_SCRIPT: &str = r#"
import sys, struct, json

def write_msg(obj):
    data = json.dumps(obj).encode()
    sys.stdout.buffer.write(struct.pack('<I', len(data)))
    sys.stdout.buffer.write(data)
    sys.stdout.buffer.flush()

write_msg({'type': 'ready'})

length_bytes = sys.stdin.buffer.read(4)
if len(length_bytes) == 4:
    length = struct.unpack('<I', length_bytes)[0]
    sys.stdin.buffer.read(length)
    write_msg({'type': 'drain_complete'})
"#;

#[tokio::test]
async fn start_then_shutdown_drives_a_real_child_through_ready_and_drain() {
    if !python3_available() {
        eprintln!("skipping: python3 not on PATH");
        return;
    }

    let command = ChildCommand {
        program: "python3".to_string(),
        args: vec!["-c".to_string(), CHILD_SCRIPT.to_string()],
    };
    let mut supervisor = Supervisor::new(command);
    assert_eq!(supervisor.state(), SupervisorState::Gone);

    supervisor.start().await.expect("child publishes ready");
    assert_eq!(supervisor.state(), SupervisorState::Ready);

    supervisor.shutdown().await.expect("graceful drain");
    assert_eq!(supervisor.state(), SupervisorState::Gone);
}

#[tokio::test]
async fn start_fails_when_the_child_exits_without_publishing_ready() {
    if !python3_available() {
        eprintln!("skipping: python3 not on PATH");
        return;
    }

    let command = ChildCommand {
        program: "python3".to_string(),
        args: vec!["-c".to_string(), "import sys; sys.exit(1)".to_string()],
    };
    let mut supervisor = Supervisor::new(command);

    let result = supervisor.start().await;
    assert!(result.is_err(), "a child that exits silently never reaches Ready");
}

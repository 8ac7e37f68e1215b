//! Real [`AgentSource`]: spawns the configured shell or coding-agent CLI
//! inside a PTY and bridges its raw output onto the session's event
//! channel, the way `cli/src/agent.rs` drives a PTY-backed process —
//! adapted here to forward bytes as `raw` events instead of owning a
//! VT100 screen buffer, since rendering is the client's job (§4.3, §4.4.4).

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::protocol::SessionKind;

use super::{AgentEvent, AgentSource, AgentSourceFactory, SpawnSpec, EVENT_AGENT_IDLE};

/// Shell used for `SessionKind::Terminal` sessions when the config doesn't
/// override it.
const DEFAULT_SHELL: &str = "/bin/sh";

/// Coding-agent CLI invoked for `SessionKind::InteractiveAgent` sessions.
const DEFAULT_AGENT_BINARY: &str = "claude";

/// Backs a session with a real PTY-spawned process.
pub struct PtyAgentSource {
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
}

impl PtyAgentSource {
    fn spawn_inner(spec: &SpawnSpec, events: broadcast::Sender<AgentEvent>) -> anyhow::Result<Self> {
        let pty_system = native_pty_system();
        let size = PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = pty_system.openpty(size)?;

        let mut cmd = build_command(spec);
        cmd.cwd(&spec.cwd);
        let _child = pair.slave.spawn_command(cmd)?;
        drop(pair.slave);

        let mut reader = pair.master.try_clone_reader()?;
        let writer = pair.master.take_writer()?;

        let session_id = spec.external_source.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        let _ = events.send(AgentEvent {
                            session_id: session_id.clone(),
                            event_name: "raw".to_string(),
                            payload: Value::String(chunk),
                        });
                    }
                    Err(e) => {
                        log::warn!("[session] pty read error for {session_id}: {e}");
                        break;
                    }
                }
            }
            let _ = events.send(AgentEvent {
                session_id,
                event_name: EVENT_AGENT_IDLE.to_string(),
                payload: Value::Null,
            });
        });

        Ok(Self {
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
        })
    }
}

fn build_command(spec: &SpawnSpec) -> CommandBuilder {
    match spec.kind {
        SessionKind::Terminal => CommandBuilder::new(DEFAULT_SHELL),
        SessionKind::InteractiveAgent => {
            let mut cmd = CommandBuilder::new(DEFAULT_AGENT_BINARY);
            if let Some(model) = &spec.model {
                cmd.arg("--model").arg(model);
            }
            if let Some(mode) = &spec.permission_mode {
                cmd.arg("--permission-mode").arg(mode);
            }
            if let Some(token) = &spec.resume_token {
                cmd.arg("--resume").arg(token);
            }
            cmd
        }
    }
}

impl AgentSource for PtyAgentSource {
    fn send_input(&self, text: &str) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().expect("pty writer mutex poisoned");
        writer.write_all(text.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn interrupt(&self) -> anyhow::Result<()> {
        // Ctrl-C over the PTY, same as a user pressing it at the keyboard.
        let mut writer = self.writer.lock().expect("pty writer mutex poisoned");
        writer.write_all(&[0x03])?;
        writer.flush()?;
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let master = self.master.lock().expect("pty master mutex poisoned");
        master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;
        Ok(())
    }
}

/// Builds [`PtyAgentSource`]s for every spawned session.
#[derive(Debug, Default)]
pub struct PtyAgentSourceFactory;

impl AgentSourceFactory for PtyAgentSourceFactory {
    fn spawn(
        &self,
        spec: &SpawnSpec,
        events: broadcast::Sender<AgentEvent>,
    ) -> anyhow::Result<Arc<dyn AgentSource>> {
        let source = PtyAgentSource::spawn_inner(spec, events)
            .map_err(|e| anyhow::anyhow!("spawn pty for {}: {e}", spec.external_source))?;
        Ok(Arc::new(source))
    }
}

use std::ffi::OsString;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::engine::{Engine, EngineProcess, ProcessControl};

const CHUNK_SIZE: usize = 4096;
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Diagnostics(String),
    Exited(Option<i32>),
}

/// Owned by exactly one session; never shared across sessions.
pub struct ProcessHandle {
    control: Arc<dyn ProcessControl>,
    kill_grace: Duration,
}

impl ProcessHandle {
    /// Sends the graceful stop signal without waiting for the exit.
    ///
    /// If the process is still around after the grace period it is killed.
    pub fn terminate(&self) -> io::Result<()> {
        self.control.terminate()?;

        // without a runtime (teardown) kill_on_drop is the only backstop left
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return Ok(());
        };
        let control = self.control.clone();
        let grace = self.kill_grace;
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if control.is_alive() {
                warn!(
                    "engine {:?} ignored termination for {:?}, killing",
                    control.id(),
                    grace
                );
                if let Err(e) = control.kill() {
                    error!("failed to kill engine {:?}: {}", control.id(), e);
                }
            }
        });
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.control.is_alive()
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.id()
    }
}

/// Launches the engine and starts pumping its diagnostics and exit into the
/// returned channel. The exit event is always the last one sent.
pub fn spawn(
    engine: &dyn Engine,
    args: &[OsString],
    kill_grace: Duration,
) -> io::Result<(ProcessHandle, mpsc::Receiver<ProcessEvent>)> {
    let EngineProcess {
        control,
        mut diagnostics,
        mut exit,
    } = engine.spawn(args)?;
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let pid = control.id();

    tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut eof = false;
        loop {
            tokio::select! {
                biased;
                read = diagnostics.read(&mut buf), if !eof => match read {
                    Ok(0) => eof = true,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if tx.send(ProcessEvent::Diagnostics(chunk)).await.is_err() {
                            debug!("diagnostics for engine {:?} have no listener", pid);
                        }
                    }
                    Err(e) => {
                        warn!("reading diagnostics of engine {:?} failed: {}", pid, e);
                        eof = true;
                    }
                },
                code = &mut exit => {
                    let _ = tx.send(ProcessEvent::Exited(code.unwrap_or(None))).await;
                    break;
                }
            }
        }
    });

    Ok((ProcessHandle { control, kill_grace }, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::engine::FfmpegEngine;

    #[tokio::test]
    async fn forwards_chunks_then_exit() {
        let engine = FakeEngine::new();
        let (handle, mut events) = spawn(engine.as_ref(), &[], Duration::from_secs(5)).unwrap();
        let process = engine.process(0);

        process.emit("frame= 1 speed=1.0x").await;
        assert_eq!(
            events.recv().await,
            Some(ProcessEvent::Diagnostics("frame= 1 speed=1.0x".into()))
        );

        process.exit(1);
        assert_eq!(events.recv().await, Some(ProcessEvent::Exited(Some(1))));
        assert_eq!(events.recv().await, None);
        assert!(!handle.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn escalates_to_kill_after_grace() {
        let engine = FakeEngine::new();
        engine.ignore_terminate(true);
        let (handle, mut events) = spawn(engine.as_ref(), &[], Duration::from_secs(5)).unwrap();
        let process = engine.process(0);

        handle.terminate().unwrap();
        assert_eq!(process.terminations(), 1);
        assert!(handle.is_alive());

        assert_eq!(events.recv().await, Some(ProcessEvent::Exited(None)));
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn terminates_a_real_child() {
        let engine = FfmpegEngine::new("sh");
        let args: Vec<OsString> = vec!["-c".into(), "echo 'speed=2.0x' >&2; exec sleep 30".into()];
        let (handle, mut events) = spawn(&engine, &args, Duration::from_secs(5)).unwrap();
        assert!(handle.pid().is_some());

        let first = events.recv().await.unwrap();
        assert_eq!(first, ProcessEvent::Diagnostics("speed=2.0x\n".into()));

        handle.terminate().unwrap();
        loop {
            match events.recv().await {
                Some(ProcessEvent::Exited(code)) => {
                    // killed by SIGTERM, so no exit code
                    assert_eq!(code, None);
                    break;
                }
                Some(ProcessEvent::Diagnostics(_)) => continue,
                None => panic!("event stream closed before exit"),
            }
        }
        assert!(!handle.is_alive());
        // racing a stop against an exited process is not an error
        handle.terminate().unwrap();
    }
}

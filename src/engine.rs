//! The external transcoding engine, seen as an opaque capability.
//!
//! The session state machine only ever talks to [`Engine`] and
//! [`ProcessControl`]; [`FfmpegEngine`] is the production implementation.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::profile::EncodeProfile;
use crate::session::SessionDescriptor;

pub trait Engine: Send + Sync + 'static {
    fn spawn(&self, args: &[OsString]) -> io::Result<EngineProcess>;
}

pub trait ProcessControl: Send + Sync {
    /// Ask the process to exit. `Ok` if it already has.
    fn terminate(&self) -> io::Result<()>;
    /// Force the process down. `Ok` if it already exited.
    fn kill(&self) -> io::Result<()>;
    fn is_alive(&self) -> bool;
    fn id(&self) -> Option<u32>;
}

pub struct EngineProcess {
    pub control: Arc<dyn ProcessControl>,
    pub diagnostics: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves with the exit code once the process has been reaped.
    pub exit: oneshot::Receiver<Option<i32>>,
}

pub struct FfmpegEngine {
    program: PathBuf,
}

impl FfmpegEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        FfmpegEngine {
            program: program.into(),
        }
    }
}

impl Engine for FfmpegEngine {
    fn spawn(&self, args: &[OsString]) -> io::Result<EngineProcess> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "engine stderr not captured"))?;
        let pid = child.id();
        let alive = Arc::new(AtomicBool::new(true));
        let (exit_tx, exit_rx) = oneshot::channel();

        let reaper_alive = alive.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("failed to wait on engine {:?}: {}", pid, e);
                    None
                }
            };
            reaper_alive.store(false, Ordering::SeqCst);
            debug!("engine {:?} exited with {:?}", pid, code);
            let _ = exit_tx.send(code);
        });

        Ok(EngineProcess {
            control: Arc::new(ChildControl { pid, alive }),
            diagnostics: Box::new(stderr),
            exit: exit_rx,
        })
    }
}

struct ChildControl {
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
}

impl ChildControl {
    fn signal(&self, signal: libc::c_int) -> io::Result<()> {
        let pid = match self.pid {
            Some(pid) if self.is_alive() => pid,
            _ => return Ok(()),
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }
}

impl ProcessControl for ChildControl {
    fn terminate(&self) -> io::Result<()> {
        self.signal(libc::SIGTERM)
    }

    fn kill(&self) -> io::Result<()> {
        self.signal(libc::SIGKILL)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn id(&self) -> Option<u32> {
        self.pid
    }
}

pub fn endpoint_url(ingest_base: &str, credential: &str) -> String {
    format!("{}/{}", ingest_base.trim_end_matches('/'), credential)
}

/// The endpoint with the credential masked, for logs.
pub fn redacted_url(ingest_base: &str) -> String {
    endpoint_url(ingest_base, "********")
}

pub fn build_args(
    descriptor: &SessionDescriptor,
    profile: &EncodeProfile,
    ingest_base: &str,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-hide_banner".into(), "-re".into()];
    if descriptor.loop_input {
        args.push("-stream_loop".into());
        args.push("-1".into());
    }
    args.push("-i".into());
    args.push(descriptor.input_path.clone().into_os_string());

    let bitrate = format!("{}k", profile.max_bitrate_kbps);
    let encode = [
        "-c:v".to_owned(),
        "libx264".to_owned(),
        "-preset".to_owned(),
        "veryfast".to_owned(),
        "-b:v".to_owned(),
        bitrate.clone(),
        "-maxrate".to_owned(),
        bitrate,
        "-bufsize".to_owned(),
        format!("{}k", profile.buffer_size_kbps),
        "-vf".to_owned(),
        profile.filter.clone(),
        "-pix_fmt".to_owned(),
        "yuv420p".to_owned(),
        "-g".to_owned(),
        "60".to_owned(),
        "-c:a".to_owned(),
        "aac".to_owned(),
        "-b:a".to_owned(),
        "128k".to_owned(),
        "-ar".to_owned(),
        "44100".to_owned(),
        "-f".to_owned(),
        "flv".to_owned(),
        endpoint_url(ingest_base, descriptor.credential.expose()),
    ];
    args.extend(encode.into_iter().map(OsString::from));
    args
}

//! Spawned audio processes: tracking, supervision and signalling.
//!
//! Every player, decoder and recorder goes through [`spawn_process`] and is
//! entered in a [`ProcessRegistry`] for as long as it runs. A stop request
//! for a tracked process is a message to the task supervising it, so callers
//! never block on process termination.

use crate::error::VoiceError;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;

/// Locks a std mutex, recovering the guard if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("audio device lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessRole {
    Player,
    Decoder,
    Recorder,
}

/// How a tracked process is asked to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopRequest {
    /// End normally; the caller still wants the result.
    Finish,
    /// Abandon; the caller's pending result is rejected.
    Cancel,
}

/// Polite signal sent before a process is killed outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Politeness {
    /// SIGINT: lets capture tools finalize their output file.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

struct Tracked {
    role: ProcessRole,
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<StopRequest>>,
}

/// Registry of every process currently holding, or about to hold, the card.
#[derive(Default)]
pub(crate) struct ProcessRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Tracked>>,
}

/// Keeps a process in the registry until dropped.
pub(crate) struct Registration {
    registry: Arc<ProcessRegistry>,
    id: u64,
}

impl Registration {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&self.registry.entries).remove(&self.id);
    }
}

impl ProcessRegistry {
    pub(crate) fn register(
        self: &Arc<Self>,
        role: ProcessRole,
        pid: Option<u32>,
    ) -> (Registration, oneshot::Receiver<StopRequest>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = oneshot::channel();
        lock(&self.entries).insert(
            id,
            Tracked {
                role,
                pid,
                stop_tx: Some(stop_tx),
            },
        );
        let registration = Registration {
            registry: self.clone(),
            id,
        };
        (registration, stop_rx)
    }

    /// Asks one process to stop. Returns `false` if it is no longer tracked
    /// or has already been asked.
    pub(crate) fn request_stop(&self, id: u64, request: StopRequest) -> bool {
        let sender = lock(&self.entries)
            .get_mut(&id)
            .and_then(|tracked| tracked.stop_tx.take());
        match sender {
            Some(tx) => tx.send(request).is_ok(),
            None => false,
        }
    }

    /// Asks every process whose role matches to stop. Returns how many were
    /// signalled.
    pub(crate) fn stop_where(
        &self,
        matches: impl Fn(ProcessRole) -> bool,
        request: StopRequest,
    ) -> usize {
        let senders: Vec<(Option<u32>, oneshot::Sender<StopRequest>)> = {
            let mut entries = lock(&self.entries);
            entries
                .values_mut()
                .filter(|tracked| matches(tracked.role))
                .filter_map(|tracked| tracked.stop_tx.take().map(|tx| (tracked.pid, tx)))
                .collect()
        };
        let mut count = 0;
        for (pid, tx) in senders {
            tracing::debug!(?pid, ?request, "stopping tracked audio process");
            if tx.send(request).is_ok() {
                count += 1;
            }
        }
        count
    }

    pub(crate) fn count(&self) -> usize {
        lock(&self.entries).len()
    }
}

/// How a supervised process ended.
#[derive(Debug)]
pub(crate) enum ProcessEnd {
    Exited(ExitStatus),
    TimedOut,
    Stopped(StopRequest),
}

/// Spawns `program` with stdout discarded and stderr forwarded to the log.
///
/// The child is killed if its handle is dropped, so an abandoned supervisor
/// cannot leave a process holding the card.
pub(crate) fn spawn_process(
    program: &str,
    args: &[String],
    stdin: Stdio,
) -> Result<Child, VoiceError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(stdin)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| VoiceError::Spawn {
        program: program.to_string(),
        source,
    })?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_stderr(program.to_string(), child.id(), stderr));
    }
    Ok(child)
}

async fn log_stderr(program: String, pid: Option<u32>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => {
                tracing::debug!(program = %program, ?pid, "{}", line);
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(program = %program, ?pid, error = %e, "stderr read failed");
                break;
            }
        }
    }
}

fn send_signal(child: &Child, politeness: Politeness) -> bool {
    #[cfg(unix)]
    {
        let Some(pid) = child.id() else {
            return false;
        };
        let signal = match politeness {
            Politeness::Interrupt => libc::SIGINT,
            Politeness::Terminate => libc::SIGTERM,
        };
        // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs
        // to a child we have not yet reaped, so it cannot have been recycled.
        unsafe { libc::kill(pid as libc::pid_t, signal) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = (child, politeness);
        false
    }
}

/// Signals the child politely, then kills it if it has not exited within
/// `grace`. Always reaps the child.
pub(crate) async fn terminate(child: &mut Child, politeness: Politeness, grace: Duration) {
    if send_signal(child, politeness)
        && tokio::time::timeout(grace, child.wait()).await.is_ok()
    {
        return;
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "kill failed, process probably already exited");
    }
    let _ = child.wait().await;
}

/// Waits for the child to exit, for `deadline` to pass, or for a stop
/// request, whichever comes first. The child is terminated in the latter two
/// cases.
pub(crate) async fn supervise(
    child: &mut Child,
    mut stop_rx: oneshot::Receiver<StopRequest>,
    deadline: Option<Duration>,
    politeness: Politeness,
    grace: Duration,
) -> Result<ProcessEnd, VoiceError> {
    let timer = async {
        match deadline {
            Some(deadline) => tokio::time::sleep(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(timer);

    tokio::select! {
        status = child.wait() => Ok(ProcessEnd::Exited(status?)),
        () = &mut timer => {
            terminate(child, politeness, grace).await;
            Ok(ProcessEnd::TimedOut)
        }
        Ok(request) = &mut stop_rx => {
            terminate(child, politeness, grace).await;
            Ok(ProcessEnd::Stopped(request))
        }
    }
}

//! One heavy pool execution unit: a worker process and its reply reader

use crate::core::cancellation::CancellationToken;
use crate::core::job::ConversionJob;
use crate::dispatch::config::WorkerCommand;
use crate::process::protocol::{read_reply, write_request, ProtocolError, WorkerReply};
use crossbeam_channel::{select, Receiver, Sender};
use std::io::{self, BufReader, BufWriter};
use std::process::{Child, ChildStdin, ChildStdout, Stdio};
use std::thread;
use std::time::{Duration, Instant};

type ReplyMessage = Result<WorkerReply, ProtocolError>;

/// Why a unit could not deliver a reply
#[derive(Debug)]
pub(crate) enum UnitFailure {
    /// The process died, closed its pipes or broke the protocol
    Crashed(String),
    /// The job's token was cancelled while the unit was working on it
    Abandoned,
}

/// A spawned worker process
///
/// Serves one job at a time. A unit that crashed or was abandoned mid-job is
/// never reused: the supervisor kills it and spawns a replacement.
pub(crate) struct ProcessUnit {
    slot: usize,
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    replies: Receiver<ReplyMessage>,
    reader: Option<thread::JoinHandle<()>>,
    jobs_run: u64,
}

impl std::fmt::Debug for ProcessUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessUnit")
            .field("slot", &self.slot)
            .field("pid", &self.child.id())
            .field("jobs_run", &self.jobs_run)
            .finish()
    }
}

impl ProcessUnit {
    /// Launch a worker process for supervisor `slot`
    pub(crate) fn spawn(command: &WorkerCommand, slot: usize) -> io::Result<Self> {
        let mut child = command
            .to_command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let pipes = child.stdin.take().zip(child.stdout.take());
        let Some((stdin, stdout)) = pipes else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "worker pipes were not captured",
            ));
        };

        let (tx, replies) = crossbeam_channel::unbounded();
        let reader = thread::Builder::new()
            .name(format!("heavy-{}-reader", slot))
            .spawn(move || read_replies(stdout, tx));
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        log::debug!("heavy unit {} spawned as pid {}", slot, child.id());

        Ok(Self {
            slot,
            child,
            stdin: Some(BufWriter::new(stdin)),
            replies,
            reader: Some(reader),
            jobs_run: 0,
        })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.child.id()
    }

    /// False once the process has exited, even if nobody reaped it yet
    pub(crate) fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Send `job` and wait for its reply or for `token` to be cancelled
    pub(crate) fn run(
        &mut self,
        job: &ConversionJob,
        token: &CancellationToken,
    ) -> Result<WorkerReply, UnitFailure> {
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
        let _cancel_guard = token.on_cancel(move || {
            let _ = cancel_tx.try_send(());
        });

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| UnitFailure::Crashed("worker stdin already closed".to_string()))?;
        if let Err(e) = write_request(stdin, job.id(), job.filename(), job.payload()) {
            if token.is_cancelled() {
                return Err(UnitFailure::Abandoned);
            }
            return Err(UnitFailure::Crashed(format!("cannot send request: {e}")));
        }
        self.jobs_run += 1;

        select! {
            recv(self.replies) -> msg => match msg {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(e)) => Err(UnitFailure::Crashed(e.to_string())),
                Err(_) => Err(UnitFailure::Crashed("worker closed its reply stream".to_string())),
            },
            recv(cancel_rx) -> _ => Err(UnitFailure::Abandoned),
        }
    }

    /// Kill the process and reap it, returning how it ended
    pub(crate) fn kill(mut self) -> String {
        self.stdin.take();
        let status = match self.child.try_wait() {
            Ok(Some(status)) => Ok(status),
            _ => {
                let _ = self.child.kill();
                self.child.wait()
            }
        };
        self.join_reader();
        match status {
            Ok(status) => status.to_string(),
            Err(e) => format!("unknown exit status: {e}"),
        }
    }

    /// Close stdin and give the process `grace` to exit on its own
    pub(crate) fn shutdown(mut self, grace: Duration) {
        self.stdin.take();
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log::debug!("heavy unit {} exited: {}", self.slot, status);
                    break;
                }
                Ok(None) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(10));
                }
                _ => {
                    log::warn!(
                        "heavy unit {} (pid {}) ignored end of input, killing it",
                        self.slot,
                        self.child.id()
                    );
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
            }
        }
        self.join_reader();
    }

    fn join_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            // The reader ends at EOF, which follows process exit
            let _ = reader.join();
        }
    }
}

impl Drop for ProcessUnit {
    fn drop(&mut self) {
        if self.reader.is_some() {
            self.stdin.take();
            let _ = self.child.kill();
            let _ = self.child.wait();
            self.join_reader();
        }
    }
}

fn read_replies(stdout: ChildStdout, tx: Sender<ReplyMessage>) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_reply(&mut reader) {
            Ok(Some(reply)) => {
                if tx.send(Ok(reply)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
}

use std::process::Stdio;
use std::time::{Duration, Instant};

use bytes::Bytes;
use procbridge::invocation::{InvocationRequest, InvocationResult, Outcome};
use procbridge::protocol::HostEnvironment;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

/// How long a killed program may take to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// How long output is still collected once a timed out program is killed.
///
/// Grandchildren may inherit the pipes and keep them open long after the program is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

const READ_CHUNK: usize = 8 * 1024;

/// Runs the program once and collects its combined stdout and stderr.
///
/// The program is killed with `SIGKILL` when the timeout elapses. Its output up to that
/// point is still returned, as it is for non-zero exit codes. The child is also killed
/// if this future is dropped, e.g. because the client went away.
pub async fn process(
    id: u64,
    host: &HostEnvironment,
    request: InvocationRequest,
) -> InvocationResult {
    let name = request.program_name();

    let mut command = Command::new(request.program());
    command
        .env_clear()
        .envs(request.environment(host))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            log::warn!(id, program = name.as_str(); "failed to start: {e}");
            return InvocationResult::failed_to_start();
        }
    };
    log::debug!(id, pid:debug = child.id(); "started {name}");

    let feeder = child
        .stdin
        .take()
        .map(|stdin| tokio::spawn(feed(id, stdin, request.stdin().clone())));

    // Both streams go into one channel, so the output is interleaved in arrival order.
    let (sink, chunks) = mpsc::unbounded_channel();
    let readers = [
        child.stdout.take().map(|stdout| tokio::spawn(capture(stdout, sink.clone()))),
        child.stderr.take().map(|stderr| tokio::spawn(capture(stderr, sink.clone()))),
    ];
    drop(sink);

    let deadline = tokio::time::Instant::from_std(start) + request.timeout();
    let waited = tokio::time::timeout_at(deadline, child.wait()).await;
    let (outcome, drain_until) = match waited {
        Ok(Ok(status)) => {
            if status.success() {
                log::debug!(id; "{name} exited with {status}");
            } else {
                log::warn!(id, program = name.as_str(); "execution failed: {status}");
            }
            let outcome = Outcome::Completed {
                exit_code: status.code(),
            };
            (outcome, deadline)
        }
        Ok(Err(e)) => {
            // The child is killed on drop at the end of this function.
            log::warn!(id, program = name.as_str(); "failed waiting for exit: {e}");
            (Outcome::Completed { exit_code: None }, deadline)
        }
        Err(_elapsed) => {
            log::warn!(
                id,
                program = name.as_str(),
                timeout:debug = request.timeout();
                "process timed out"
            );
            kill(id, &mut child).await;
            (
                Outcome::KilledByTimeout,
                tokio::time::Instant::now() + DRAIN_GRACE,
            )
        }
    };

    // Background processes of a finished program may still write until the timeout.
    let output = drain(chunks, drain_until).await;
    for reader in readers.into_iter().flatten() {
        reader.abort();
    }
    if let Some(feeder) = feeder {
        feeder.abort();
    }

    let time_taken = start.elapsed();
    log::debug!(id, time_taken:debug, outcome:display; "finished {name}");
    log::debug!(id; "output: {}", String::from_utf8_lossy(&output).trim());
    InvocationResult::new(output, outcome)
}

/// Sends `SIGKILL` and reaps the child.
async fn kill(id: u64, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        log::warn!(id; "failed to kill: {e}");
        return;
    }
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => log::debug!(id; "killed process reaped: {status}"),
        Ok(Err(e)) => log::warn!(id; "failed to reap killed process: {e}"),
        Err(_) => log::warn!(id; "killed process not reaped within {REAP_TIMEOUT:?}"),
    }
}

/// Writes the payload and closes stdin.
async fn feed(id: u64, mut stdin: ChildStdin, payload: Bytes) {
    // Programs are free to ignore their input and exit early.
    if let Err(e) = stdin.write_all(&payload).await {
        log::debug!(id; "stdin not fully consumed: {e}");
    }
}

async fn capture<R: AsyncRead + Unpin>(mut stream: R, sink: mpsc::UnboundedSender<Bytes>) {
    let mut buffer = vec![0; READ_CHUNK];
    loop {
        match stream.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if sink.send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                    break;
                }
            }
        }
    }
}

/// Collects chunks until every reader is done or `deadline` has passed.
async fn drain(
    mut chunks: mpsc::UnboundedReceiver<Bytes>,
    deadline: tokio::time::Instant,
) -> Vec<u8> {
    let mut output = Vec::new();
    while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, chunks.recv()).await {
        output.extend_from_slice(&chunk);
    }
    output
}

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::Context;
use config::Config as CConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Duration;

const CONFIG_FILE: &str = "config.toml";

fn main() -> anyhow::Result<()> {
    let config = Config::new(CONFIG_FILE).context("Error loading config")?;
    tracing_subscriber::fmt::init();

    // One strategy per run. The thread fleet drives blocking sockets from OS
    // threads, the task fleet multiplexes async sockets on a single-threaded
    // runtime, so main itself stays synchronous and builds what it needs.
    match config.strategy {
        Strategy::Threads => {
            run_threads(config)?;
        }
        Strategy::Tasks => {
            let counts = run_tasks(config)?;
            let total: u64 = counts.iter().sum();
            println!("Total messages sent and received: {}", total);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
struct Config {
    log_level: String,
    strategy: Strategy,
    target: String,
    population: usize,
    payload: String,
    iterations: u64,
    duration: Duration,
    timeout: Duration,
    recv_limit: usize,
}

impl Config {
    fn new(path: &str) -> anyhow::Result<Self> {
        let mut c = CConfig::new();
        c.merge(config::File::with_name(path))?;
        let config: Self = c.try_into()?;
        std::env::set_var("RUST_LOG", &config.log_level);
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            strategy: Strategy::Threads,
            target: "127.0.0.1:8008".to_string(),
            population: 200,
            payload: "-".repeat(240),
            iterations: 100,
            duration: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            recv_limit: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
enum Strategy {
    Threads,
    Tasks,
}

// Launches the whole population as named OS threads and joins every one of
// them. The join is what keeps the process alive until the last worker is
// done; it doubles as the wait-group feeding the tally.
fn run_threads(config: Config) -> anyhow::Result<Tally> {
    tracing::info!(
        "Starting thread fleet [population={} target={} iterations={}]",
        config.population,
        config.target,
        config.iterations
    );
    let config = Arc::new(config);
    let mut handles = Vec::with_capacity(config.population);
    for id in 0..config.population {
        let config = config.clone();
        // Failing to spawn is the one fatal error of the run: without the
        // full population there is no fleet to measure.
        let handle = thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || blocking_worker(id, &config))
            .context("Error spawning worker thread")?;
        handles.push(handle);
    }

    let mut tally = Tally::default();
    for handle in handles {
        match handle.join() {
            Ok(outcome) => tally.record(&outcome),
            Err(_) => tally.panicked += 1,
        }
    }
    tracing::info!(
        "Thread fleet finished [succeeded={} timed_out={} aborted={} panicked={}]",
        tally.succeeded,
        tally.timed_out,
        tally.aborted,
        tally.panicked
    );
    Ok(tally)
}

// One thread, one connection, a fixed number of round trips. A failure is
// terminal for this worker only: we record the outcome and let the siblings
// run. The session closes on every path out of here.
fn blocking_worker(id: usize, config: &Config) -> Outcome {
    let mut session = match Session::open(&config.target, config.timeout) {
        Ok(session) => session,
        Err(err) => {
            // Refused and timed-out connects share one outcome; the fleet
            // only cares that this worker never got going.
            tracing::warn!("Worker could not connect [worker={}]: {}", id, err);
            return Outcome {
                worker: id,
                completed: 0,
                status: Status::TimedOut,
            };
        }
    };

    let payload = config.payload.as_bytes();
    let mut buf = vec![0u8; config.recv_limit];
    let mut completed = 0;
    let status = loop {
        if completed == config.iterations {
            break Status::Success;
        }
        if let Err(err) = session.send(payload) {
            tracing::warn!(
                "Worker send failed [worker={} completed={}]: {}",
                id,
                completed,
                err
            );
            break match err {
                SessionError::Timeout(_) => Status::TimedOut,
                _ => Status::Aborted,
            };
        }
        match session.receive(&mut buf) {
            // An empty read means the peer closed on us mid-run.
            Ok(0) => {
                tracing::warn!("Worker lost its peer [worker={} completed={}]", id, completed);
                break Status::Aborted;
            }
            Ok(n) => {
                // Each response chunk is surfaced as it arrives. Interleaving
                // with the other workers' output is unordered and accepted.
                println!("{}", String::from_utf8_lossy(&buf[..n]));
                completed += 1;
            }
            Err(SessionError::Timeout(timeout)) => {
                tracing::warn!(
                    "Worker receive timed out [worker={} completed={} timeout={:?}]",
                    id,
                    completed,
                    timeout
                );
                break Status::TimedOut;
            }
            Err(err) => {
                tracing::warn!(
                    "Worker receive failed [worker={} completed={}]: {}",
                    id,
                    completed,
                    err
                );
                break Status::Aborted;
            }
        }
    };
    session.close();
    Outcome {
        worker: id,
        completed,
        status,
    }
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    timed_out: usize,
    aborted: usize,
    panicked: usize,
}

impl Tally {
    fn record(&mut self, outcome: &Outcome) {
        tracing::debug!(
            "Worker finished [worker={} completed={} status={:?}]",
            outcome.worker,
            outcome.completed,
            outcome.status
        );
        match outcome.status {
            Status::Success => self.succeeded += 1,
            Status::TimedOut => self.timed_out += 1,
            Status::Aborted => self.aborted += 1,
        }
    }
}

// Runs the cooperative fleet on a current-thread runtime: every worker is a
// task multiplexed on this one thread, suspending only at the socket writes
// and the timeout-wrapped reads.
fn run_tasks(config: Config) -> anyhow::Result<Vec<u64>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Error building runtime")?;
    runtime.block_on(run_task_fleet(Arc::new(config)))
}

async fn run_task_fleet(config: Arc<Config>) -> anyhow::Result<Vec<u64>> {
    tracing::info!(
        "Starting task fleet [population={} target={} duration={:?}]",
        config.population,
        config.target,
        config.duration
    );
    // One counter slot per worker, written only by the worker that owns the
    // index and read only after the join. The atomics keep the slots valid
    // even if this fleet ever moves to a multi-threaded runtime.
    let counters: Arc<Vec<AtomicU64>> =
        Arc::new((0..config.population).map(|_| AtomicU64::new(0)).collect());

    let mut handles = Vec::with_capacity(config.population);
    for id in 0..config.population {
        let config = config.clone();
        let counters = counters.clone();
        handles.push(tokio::spawn(task_worker(id, config, counters)));
    }

    // Structured join: we wait for every worker, then surface the first
    // failure. A failing worker never cancels a running sibling.
    let mut first_error: Option<anyhow::Error> = None;
    for (id, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!("Worker failed [worker={}]: {}", id, err);
                if first_error.is_none() {
                    first_error = Some(err.into());
                }
            }
            Err(err) => {
                tracing::warn!("Worker panicked [worker={}]: {}", id, err);
                if first_error.is_none() {
                    first_error = Some(err.into());
                }
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    let counts: Vec<u64> = counters.iter().map(|c| c.load(Ordering::Relaxed)).collect();
    tracing::info!(
        "Task fleet finished [population={} round_trips={}]",
        counts.len(),
        counts.iter().sum::<u64>()
    );
    Ok(counts)
}

// One task, one connection, round trips until the shared deadline passes.
// The deadline is only checked between round trips, so a worker that is
// mid-receive when it passes finishes that round trip first.
async fn task_worker(
    id: usize,
    config: Arc<Config>,
    counters: Arc<Vec<AtomicU64>>,
) -> Result<(), SessionError> {
    let mut session = AsyncSession::open(&config.target, config.timeout).await?;
    let payload = config.payload.as_bytes();
    let mut buf = vec![0u8; config.recv_limit];
    let start = Instant::now();
    while start.elapsed() < config.duration {
        session.send(payload).await?;
        match session.receive(&mut buf).await? {
            0 => return Err(SessionError::Closed),
            _ => {
                counters[id].fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    session.close().await?;
    Ok(())
}

#[derive(Debug)]
struct Outcome {
    worker: usize,
    completed: u64,
    status: Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Success,
    TimedOut,
    Aborted,
}

// One established connection, exclusively owned by the worker that opened it.
// The socket lives in an Option so close runs at most once no matter which
// path reaches it first; Drop covers the paths that never call it.
struct Session {
    stream: Option<TcpStream>,
    timeout: Duration,
}

impl Session {
    fn open(target: &str, timeout: Duration) -> Result<Self, SessionError> {
        let addr: SocketAddr = target
            .to_socket_addrs()
            .map_err(|err| SessionError::Connect(target.to_string(), err))?
            .next()
            .ok_or_else(|| {
                SessionError::Connect(
                    target.to_string(),
                    std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address"),
                )
            })?;
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|err| SessionError::Connect(target.to_string(), err))?;
        // The read timeout is what upper-bounds a stalled round trip.
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(Self {
            stream: Some(stream),
            timeout,
        })
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let timeout = self.timeout;
        match self.stream_mut()?.write_all(bytes) {
            Ok(()) => Ok(()),
            Err(err) if is_timeout(&err) => Err(SessionError::Timeout(timeout)),
            Err(err) => Err(SessionError::Io(err)),
        }
    }

    // Returns the number of bytes received; 0 means the peer closed its end.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let timeout = self.timeout;
        match self.stream_mut()?.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if is_timeout(&err) => Err(SessionError::Timeout(timeout)),
            Err(err) => Err(SessionError::Io(err)),
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            // Best effort; the peer may already be gone.
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, SessionError> {
        self.stream.as_mut().ok_or(SessionError::Closed)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

// A blocking socket with a read timeout reports the expiry as WouldBlock on
// some platforms and TimedOut on others.
fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// The async twin of Session. Suspending on a full send buffer or an empty
// receive buffer parks this task only; the timeout bounds the connect and
// the receive, never the siblings.
#[derive(Debug)]
struct AsyncSession {
    stream: Option<tokio::net::TcpStream>,
    timeout: Duration,
}

impl AsyncSession {
    async fn open(target: &str, timeout: Duration) -> Result<Self, SessionError> {
        // An unreachable target must not park the task forever, so the same
        // timeout that bounds receives also bounds the handshake.
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(target))
            .await
            .map_err(|_| {
                SessionError::Connect(target.to_string(), std::io::ErrorKind::TimedOut.into())
            })?
            .map_err(|err| SessionError::Connect(target.to_string(), err))?;
        Ok(Self {
            stream: Some(stream),
            timeout,
        })
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        self.stream_mut()?.write_all(bytes).await?;
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.stream_mut()?.read(buf)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(SessionError::Timeout(timeout)),
        }
    }

    // The graceful half of the close: flush, signal EOF and wait for the
    // transport to confirm before releasing the socket. Dropping the session
    // still releases the socket on the paths that never get here.
    async fn close(&mut self) -> Result<(), SessionError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn stream_mut(&mut self) -> Result<&mut tokio::net::TcpStream, SessionError> {
        self.stream.as_mut().ok_or(SessionError::Closed)
    }
}

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, #[source] std::io::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("peer closed the connection")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

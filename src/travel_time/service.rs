use std::{
    fs::File,
    io::{BufReader, Write},
    path::PathBuf,
    process::{Child, ChildStdout, Command, Stdio},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};

use super::record::{Minutes, TravelTimeError, TravelTimeReader, TravelTimeRecord};
use crate::grid::grid::GridId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportMode {
    Walk,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub id: GridId,
    pub lon: f64,
    pub lat: f64,
}

impl Location {
    pub fn new(id: GridId, point: &geo::Point) -> Self {
        Self {
            id,
            lon: point.x(),
            lat: point.y(),
        }
    }
}

/// One travel-time matrix computation: all origins to all destinations of a city.
#[derive(Debug, Clone, Serialize)]
pub struct TravelTimeRequest {
    pub city: String,
    pub origins: Vec<Location>,
    pub destinations: Vec<Location>,
    pub mode: TransportMode,
    pub max_walk_time_min: Minutes,
    pub walk_speed_kmh: f64,
    pub percentile: u8,
}

pub type TravelTimeStream<'a> =
    Box<dyn Iterator<Item = Result<TravelTimeRecord, TravelTimeError>> + 'a>;

/// A started routing computation owning whatever resources the backend needs.
pub trait RoutingSession: Send {
    /// The response as a stream of records grouped by origin.
    fn travel_times(&mut self) -> anyhow::Result<TravelTimeStream<'_>>;

    /// Release the session's resources. Called exactly once.
    fn shutdown(&mut self) -> anyhow::Result<()>;
}

pub trait TravelTimeService: Send + Sync {
    fn start(&self, request: &TravelTimeRequest) -> anyhow::Result<Box<dyn RoutingSession>>;
}

/// Shuts its session down when closed or dropped, including on error paths and unwinding.
pub struct SessionGuard {
    session: Box<dyn RoutingSession>,
    closed: bool,
}

impl SessionGuard {
    pub fn start(
        service: &dyn TravelTimeService,
        request: &TravelTimeRequest,
    ) -> anyhow::Result<Self> {
        let session = service
            .start(request)
            .with_context(|| format!("Starting routing session for {}", request.city))?;
        Ok(Self {
            session,
            closed: false,
        })
    }

    pub fn travel_times(&mut self) -> anyhow::Result<TravelTimeStream<'_>> {
        self.session.travel_times()
    }

    /// Shut the session down, reporting failures to the caller.
    pub fn close(mut self) -> anyhow::Result<()> {
        self.closed = true;
        self.session.shutdown()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(err) = self.session.shutdown() {
                log::warn!("Routing session shutdown failed: {:#}", err);
            }
        }
    }
}

/// Matrices computed ahead of time, one `<city>.csv` per city.
pub struct PrecomputedMatrixService {
    matrix_dir: PathBuf,
}

impl PrecomputedMatrixService {
    pub fn new(matrix_dir: PathBuf) -> Self {
        Self { matrix_dir }
    }
}

struct PrecomputedSession {
    filepath: PathBuf,
}

impl RoutingSession for PrecomputedSession {
    fn travel_times(&mut self) -> anyhow::Result<TravelTimeStream<'_>> {
        let file = File::open(&self.filepath)
            .with_context(|| format!("Opening travel time matrix {:?}", self.filepath))?;
        Ok(Box::new(TravelTimeReader::new(BufReader::new(file))?))
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl TravelTimeService for PrecomputedMatrixService {
    fn start(&self, request: &TravelTimeRequest) -> anyhow::Result<Box<dyn RoutingSession>> {
        let filepath = self.matrix_dir.join(format!("{}.csv", request.city));
        if !filepath.exists() {
            bail!("Travel time matrix {:?} not found", filepath);
        }
        Ok(Box::new(PrecomputedSession { filepath }))
    }
}

/// An external router run as a child process. The JSON request goes to its stdin and the
/// matrix is read as CSV from its stdout.
pub struct CommandService {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandService {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

/// Time a routing process gets to exit on its own before it is killed.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(2);

struct CommandSession {
    child: Child,
    stdout: Option<ChildStdout>,
    request_writer: Option<JoinHandle<std::io::Result<()>>>,
}

impl RoutingSession for CommandSession {
    fn travel_times(&mut self) -> anyhow::Result<TravelTimeStream<'_>> {
        let stdout = self
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Routing process output was already consumed"))?;
        Ok(Box::new(TravelTimeReader::new(BufReader::new(stdout))?))
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        self.stdout = None;
        let started = Instant::now();
        let status = loop {
            if let Some(status) = self.child.try_wait()? {
                break Some(status);
            }
            if started.elapsed() >= SHUTDOWN_GRACE_PERIOD {
                log::debug!("Killing routing process {}", self.child.id());
                self.child.kill()?;
                self.child.wait()?;
                break None;
            }
            std::thread::sleep(Duration::from_millis(20));
        };
        let written = match self.request_writer.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("Request writer thread panicked"))?,
            None => Ok(()),
        };
        if let Some(status) = status {
            if !status.success() {
                bail!("Routing process exited with {}", status);
            }
            written.context("Writing the routing request")?;
        }
        Ok(())
    }
}

impl TravelTimeService for CommandService {
    fn start(&self, request: &TravelTimeRequest) -> anyhow::Result<Box<dyn RoutingSession>> {
        let payload = serde_json::to_vec(request)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("Spawning routing process {:?}", self.program))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Routing process has no stdin"))?;
        let stdout = child.stdout.take();
        // A separate writer keeps a large request from deadlocking against unread output.
        let request_writer = std::thread::spawn(move || stdin.write_all(&payload));
        Ok(Box::new(CommandSession {
            child,
            stdout,
            request_writer: Some(request_writer),
        }))
    }
}

fn default_max_walk_time_min() -> Minutes {
    30
}

fn default_walk_speed_kmh() -> f64 {
    3.6
}

fn default_percentile() -> u8 {
    50
}

fn default_chunk_size() -> usize {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub enum TravelTimeServiceConfig {
    Precomputed {
        matrix_dir: PathBuf,
    },
    Command {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl TravelTimeServiceConfig {
    pub fn build(&self) -> Box<dyn TravelTimeService> {
        match self {
            TravelTimeServiceConfig::Precomputed { matrix_dir } => {
                Box::new(PrecomputedMatrixService::new(matrix_dir.clone()))
            }
            TravelTimeServiceConfig::Command { program, args } => {
                Box::new(CommandService::new(program.clone(), args.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TravelTimeConfig {
    pub service: TravelTimeServiceConfig,
    #[serde(default = "default_max_walk_time_min")]
    pub max_walk_time_min: Minutes,
    #[serde(default = "default_walk_speed_kmh")]
    pub walk_speed_kmh: f64,
    #[serde(default = "default_percentile")]
    pub percentile: u8,
    /// Maximum number of distinct origins aggregated at once.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Categories reached later than this do not count towards `n`.
    #[serde(default)]
    pub time_budget_min: Option<Minutes>,
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    use anyhow::bail;
    use testdir::testdir;

    use super::{
        CommandService, PrecomputedMatrixService, RoutingSession, SessionGuard,
        TransportMode, TravelTimeRequest, TravelTimeService, TravelTimeStream,
    };
    use crate::travel_time::record::TravelTimeRecord;

    /// Serves fixed records per city and counts shutdowns.
    #[derive(Default)]
    pub(crate) struct InMemoryService {
        pub(crate) matrices: HashMap<String, Vec<TravelTimeRecord>>,
        pub(crate) failing_cities: HashSet<String>,
        pub(crate) shutdowns: Arc<AtomicUsize>,
    }

    struct InMemorySession {
        records: Vec<TravelTimeRecord>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl RoutingSession for InMemorySession {
        fn travel_times(&mut self) -> anyhow::Result<TravelTimeStream<'_>> {
            Ok(Box::new(self.records.iter().copied().map(Ok)))
        }

        fn shutdown(&mut self) -> anyhow::Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl TravelTimeService for InMemoryService {
        fn start(&self, request: &TravelTimeRequest) -> anyhow::Result<Box<dyn RoutingSession>> {
            if self.failing_cities.contains(&request.city) {
                bail!("Router unavailable for {}", request.city);
            }
            Ok(Box::new(InMemorySession {
                records: self.matrices.get(&request.city).cloned().unwrap_or_default(),
                shutdowns: self.shutdowns.clone(),
            }))
        }
    }

    pub(crate) fn request(city: &str) -> TravelTimeRequest {
        TravelTimeRequest {
            city: city.to_string(),
            origins: vec![],
            destinations: vec![],
            mode: TransportMode::Walk,
            max_walk_time_min: 30,
            walk_speed_kmh: 3.6,
            percentile: 50,
        }
    }

    fn shell(script: &str) -> CommandService {
        CommandService::new("sh".into(), vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_guard_shuts_down_once() {
        let service = InMemoryService::default();
        let guard = SessionGuard::start(&service, &request("a")).unwrap();
        guard.close().unwrap();
        assert_eq!(service.shutdowns.load(Ordering::SeqCst), 1);

        let mut guard = SessionGuard::start(&service, &request("a")).unwrap();
        assert_eq!(guard.travel_times().unwrap().count(), 0);
        drop(guard);
        assert_eq!(service.shutdowns.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_guard_shuts_down_on_panic() {
        let service = InMemoryService::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = SessionGuard::start(&service, &request("a")).unwrap();
            panic!("aggregation failed");
        }));
        assert!(result.is_err());
        assert_eq!(service.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_json() {
        let json = serde_json::to_value(request("berlin")).unwrap();
        assert_eq!(json["mode"], "WALK");
        assert_eq!(json["max_walk_time_min"], 30);
    }

    #[test]
    fn test_precomputed_matrix_service() {
        let dir = testdir!();
        std::fs::write(
            dir.join("berlin.csv"),
            "from_id,to_id,travel_time_p50\n1,2,3\n",
        )
        .unwrap();
        let service = PrecomputedMatrixService::new(dir);
        assert!(SessionGuard::start(&service, &request("paris")).is_err());
        let mut guard = SessionGuard::start(&service, &request("berlin")).unwrap();
        let records: Vec<_> = guard.travel_times().unwrap().collect();
        assert_eq!(records.len(), 1);
        guard.close().unwrap();
    }

    #[test]
    fn test_command_service() {
        let service = shell("cat > /dev/null; printf 'from_id,to_id,travel_time_p50\\n4,5,6\\n'");
        let mut guard = SessionGuard::start(&service, &request("berlin")).unwrap();
        let records: Vec<TravelTimeRecord> = guard
            .travel_times()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            records,
            vec![TravelTimeRecord {
                from_id: 4,
                to_id: 5,
                travel_time: 6
            }]
        );
        guard.close().unwrap();
    }

    #[test]
    fn test_command_service_failure() {
        let service = shell("cat > /dev/null; exit 3");
        let mut guard = SessionGuard::start(&service, &request("berlin")).unwrap();
        assert!(guard.travel_times().is_err());
        assert!(guard.close().is_err());
    }

    #[test]
    fn test_running_command_is_killed() {
        let service = shell("cat > /dev/null; sleep 30");
        let guard = SessionGuard::start(&service, &request("berlin")).unwrap();
        let start = Instant::now();
        guard.close().unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}

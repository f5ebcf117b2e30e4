//! Core application runner for `proximity-listener`.
//!
//! This module is decoupled from CLI parsing and process exit codes so it can be
//! tested deterministically with an injected driver factory, shutdown future and
//! output streams.

use crate::driver::{Backend, DriverError, DriverSink, RadioDriver, ScanSettings};
use crate::engine::{Engine, EngineConfig, FailureReports};
use crate::location::DeviceLocation;
use crate::output::OutputFormatter;
use crate::output::influxdb::InfluxDbFormatter;
use crate::registry::{DEFAULT_NEARBY_RSSI, FilterCriteria, MatchRules};
use crate::repository::{LocationRepository, RepositoryEvent};
use crate::service_uuid::ServiceUuid;
use crate::session::{Preconditions, SessionError};
use clap::Parser;
use log::{debug, info, warn};
use std::future::Future;
use std::io;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time;

/// Shortest accepted location publish interval.
const MIN_LOCATION_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for the core run loop.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Bluetooth radio backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Service UUID that marks a peer as known. Repeatable.
    /// Accepts 16-bit (feaa), 32-bit or full 128-bit forms.
    /// Without any, every advertised service counts.
    #[arg(long = "service-uuid", value_name = "UUID")]
    pub service_uuids: Vec<ServiceUuid>,

    /// Report peers even when they advertise no known service
    #[arg(long)]
    pub no_service_filter: bool,

    /// Only report peers that have been seen at or above the nearby threshold
    #[arg(long)]
    pub nearby_only: bool,

    /// Nearby threshold in dBm
    #[arg(long, default_value_t = DEFAULT_NEARBY_RSSI, allow_negative_numbers = true, value_name = "DBM")]
    pub nearby_rssi: i16,

    /// Only accept advertisements carrying exactly this name
    #[arg(long, value_name = "NAME")]
    pub name_filter: Option<String>,

    /// Collect samples for this long before delivering them as one batch.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h. 0 disables batching.
    #[arg(long, default_value = "100ms", value_parser = parse_duration)]
    pub report_delay: Duration,

    /// Fixed device location to publish, as LAT,LON[,ACCURACY].
    /// Enables the location service.
    #[arg(long, value_parser = crate::location::parse_fix, value_name = "LAT,LON[,ACC]", allow_hyphen_values = true)]
    pub location: Option<DeviceLocation>,

    /// How often the fixed location is republished
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    pub location_interval: Duration,

    /// Refuse to scan unless a location fix is supplied with --location.
    /// Linux has no location service, so scanning does not need one by default
    #[arg(long)]
    pub require_location: bool,

    /// Prefix for measurement names in InfluxDB line protocol
    #[arg(long, default_value = "proximity")]
    pub measurement_prefix: String,

    /// Verbose output, log at debug level
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    /// Engine parameters derived from the command line.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            settings: ScanSettings {
                report_delay: self.report_delay,
                name_filter: self.name_filter.clone(),
            },
            criteria: FilterCriteria {
                require_known_service: !self.no_service_filter,
                nearby_only: self.nearby_only,
            },
            rules: MatchRules {
                known_services: self.service_uuids.clone(),
                nearby_rssi: self.nearby_rssi,
            },
            preconditions: Preconditions {
                location_service_enabled: self.location.is_some(),
                location_required: self.require_location,
                ..Preconditions::default()
            },
        }
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Driver construction, injectable so tests run without Bluetooth hardware.
pub trait DriverFactory {
    type Driver: RadioDriver + 'static;

    fn open(&self, backend: Backend, sink: DriverSink) -> Result<Self::Driver, DriverError>;
}

/// Opens the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealDriverFactory;

impl DriverFactory for RealDriverFactory {
    type Driver = Box<dyn RadioDriver>;

    fn open(&self, backend: Backend, sink: DriverSink) -> Result<Self::Driver, DriverError> {
        crate::driver::open(backend, sink)
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use proximity_fusion::app::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, unit, millis_per_unit): (&str, &str, u64) =
        if let Some(num) = src.strip_suffix("ms") {
            (num, "milliseconds", 1)
        } else if let Some(num) = src.strip_suffix('h') {
            (num, "hours", 3_600_000)
        } else if let Some(num) = src.strip_suffix('m') {
            (num, "minutes", 60_000)
        } else if let Some(num) = src.strip_suffix('s') {
            (num, "seconds", 1_000)
        } else {
            // No suffix, treat as seconds
            (src, "duration", 1_000)
        };

    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid {unit}: {num}"))?;
    value
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration too long: {src}"))
}

/// Republish a fixed location every `every`, stamped with the current time.
async fn publish_location(repository: Arc<LocationRepository>, fix: DeviceLocation, every: Duration) {
    let mut ticks = time::interval(every.max(MIN_LOCATION_INTERVAL));
    loop {
        ticks.tick().await;
        if let Err(e) = repository.set_current_location(fix.at(SystemTime::now())) {
            warn!("location publisher stopped: {e}");
            return;
        }
    }
}

fn write_lines(out: &mut dyn Write, lines: &[String]) -> io::Result<()> {
    for line in lines {
        writeln!(out, "{line}")?;
    }
    Ok(())
}

/// The report loop's inputs.
struct Reports<'a> {
    formatter: &'a dyn OutputFormatter,
    repository: &'a LocationRepository,
    updates: &'a mut broadcast::Receiver<RepositoryEvent>,
    failures: &'a mut FailureReports,
}

impl Reports<'_> {
    async fn run<S>(
        &mut self,
        shutdown: S,
        out: &mut dyn Write,
        err: &mut dyn Write,
    ) -> Result<(), RunError>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            // repository updates drain before a failure ends the loop
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    return Ok(());
                }
                update = self.updates.recv() => match update {
                    Ok(RepositoryEvent::LocationChanged(location)) => {
                        writeln!(out, "{}", self.formatter.format_location(&location))?;
                    }
                    Ok(RepositoryEvent::PeersChanged(peers)) => {
                        write_lines(out, &self.formatter.format_peers(&peers, SystemTime::now()))?;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("report loop lagged, {skipped} updates skipped");
                        writeln!(err, "lagged: {skipped} updates skipped")?;
                        self.write_view(out)?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
                Some(failure) = self.failures.recv() => return Err(failure.into()),
            }
        }
    }

    /// Write the current location and peers in place of missed updates.
    fn write_view(&self, out: &mut dyn Write) -> io::Result<()> {
        let view = self.repository.fused_view();
        if let Some(location) = view.location {
            writeln!(out, "{}", self.formatter.format_location(&location))?;
        }
        write_lines(out, &self.formatter.format_peers(&view.peers, SystemTime::now()))
    }
}

/// Run the scan, writing formatted reports to `out` and notices to `err`.
///
/// - Every repository notification is written as InfluxDB line protocol.
/// - When the report loop falls behind, the skipped count goes to `err` and
///   the current view is written once in place of the missed updates.
/// - Returns `Ok` when `shutdown` resolves, or the first scan failure.
pub async fn run_with_io<F, S>(
    options: Options,
    drivers: &F,
    shutdown: S,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<(), RunError>
where
    F: DriverFactory,
    S: Future<Output = ()>,
{
    let formatter = InfluxDbFormatter::new(options.measurement_prefix.clone());
    let repository = Arc::new(LocationRepository::new());
    let mut updates = repository.subscribe();

    let backend = options.backend;
    let (engine, handle, mut failures) = Engine::new(
        options.engine_config(),
        Arc::clone(&repository),
        |sink| drivers.open(backend, sink),
    )?;
    let engine_task = tokio::spawn(engine.run());
    info!("scanning with the {backend} backend");

    let publisher = options.location.map(|fix| {
        tokio::spawn(publish_location(
            Arc::clone(&repository),
            fix,
            options.location_interval,
        ))
    });

    let result = match handle.start().await {
        Ok(()) => {
            let mut reports = Reports {
                formatter: &formatter,
                repository: &repository,
                updates: &mut updates,
                failures: &mut failures,
            };
            reports.run(shutdown, out, err).await
        }
        Err(e) => Err(e.into()),
    };

    if let Some(publisher) = publisher {
        publisher.abort();
    }
    if let Err(e) = handle.shutdown().await {
        debug!("engine already gone: {e}");
    }
    if let Err(e) = engine_task.await {
        warn!("engine task ended abnormally: {e}");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverEvent, failure};
    use crate::session::Precondition;
    use crate::test_utils::{FakeDriver, TEST_MAC, at};
    use std::sync::Mutex;

    /// Hands out one scripted fake driver.
    struct ScriptedFactory {
        script: Mutex<Option<Vec<DriverEvent>>>,
    }

    impl ScriptedFactory {
        fn new(script: Vec<DriverEvent>) -> Self {
            Self {
                script: Mutex::new(Some(script)),
            }
        }
    }

    impl DriverFactory for ScriptedFactory {
        type Driver = FakeDriver;

        fn open(&self, _backend: Backend, sink: DriverSink) -> Result<FakeDriver, DriverError> {
            let script = self.script.lock().unwrap().take().unwrap_or_default();
            Ok(FakeDriver::scripted(sink, script))
        }
    }

    struct BrokenFactory;

    impl DriverFactory for BrokenFactory {
        type Driver = FakeDriver;

        fn open(&self, backend: Backend, _sink: DriverSink) -> Result<FakeDriver, DriverError> {
            Err(DriverError::BackendNotAvailable(backend.to_string()))
        }
    }

    fn options(args: &[&str]) -> Options {
        let argv = std::iter::once("proximity-listener").chain(args.iter().copied());
        Options::try_parse_from(argv).unwrap()
    }

    fn tag_sample() -> crate::sample::SignalSample {
        crate::sample::SignalSample::new(TEST_MAC, -45, at(1))
            .with_name("Tag")
            .with_tx_power(-59)
    }

    #[test]
    fn test_options_defaults() {
        let options = options(&[]);
        let config = options.engine_config();

        assert_eq!(config.settings, ScanSettings::default());
        assert_eq!(config.criteria, FilterCriteria::default());
        assert_eq!(config.rules, MatchRules::default());
        assert!(!config.preconditions.location_service_enabled);
        assert!(!config.preconditions.location_required);
        assert_eq!(options.measurement_prefix, "proximity");
        assert_eq!(options.location_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_options_full() {
        let options = options(&[
            "--service-uuid",
            "feaa",
            "--service-uuid",
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e",
            "--nearby-only",
            "--nearby-rssi",
            "-65",
            "--name-filter",
            "softlogistics",
            "--report-delay",
            "0",
            "--location",
            "-33.86,151.2,5",
        ]);
        let config = options.engine_config();

        assert_eq!(
            config.rules.known_services,
            vec![
                ServiceUuid::from_u16(0xFEAA),
                ServiceUuid(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e)
            ]
        );
        assert_eq!(config.rules.nearby_rssi, -65);
        assert!(config.criteria.nearby_only);
        assert!(config.criteria.require_known_service);
        assert_eq!(config.settings.report_delay, Duration::ZERO);
        assert_eq!(config.settings.name_filter.as_deref(), Some("softlogistics"));
        assert!(config.preconditions.location_service_enabled);
        assert_eq!(options.location.map(|l| l.latitude), Some(-33.86));
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let argv = ["proximity-listener", "--location", "91,0"];
        assert!(Options::try_parse_from(argv).is_err());
        let argv = ["proximity-listener", "--service-uuid", "xyz"];
        assert!(Options::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration(" 30 ").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert_eq!(parse_duration("xm").unwrap_err(), "invalid minutes: x");
    }

    #[tokio::test]
    async fn run_writes_peers_until_scan_fails() {
        let factory = ScriptedFactory::new(vec![
            DriverEvent::Sample(tag_sample()),
            DriverEvent::Failed {
                code: failure::SCAN_FAILED_INTERNAL_ERROR,
            },
        ]);
        let options = options(&["--no-service-filter"]);

        let mut out = Vec::<u8>::new();
        let mut err = Vec::<u8>::new();
        let result = run_with_io(
            options,
            &factory,
            std::future::pending(),
            &mut out,
            &mut err,
        )
        .await;

        assert!(matches!(
            result,
            Err(RunError::Session(SessionError::DriverReportedFailure {
                code: failure::SCAN_FAILED_INTERNAL_ERROR
            }))
        ));
        assert!(err.is_empty());

        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("proximity_peers count=1i "));
        assert!(lines[1].starts_with("proximity_peer,identity=AA:BB:CC:DD:EE:FF,name=Tag "));
        assert!(lines[1].contains("rssi=-45i"));
        assert!(out.ends_with('\n'));
    }

    #[tokio::test]
    async fn run_skips_unknown_service_peers() {
        let factory = ScriptedFactory::new(vec![
            DriverEvent::Sample(tag_sample()),
            DriverEvent::Failed {
                code: failure::SCAN_FAILED_INTERNAL_ERROR,
            },
        ]);
        let options = options(&["--service-uuid", "feaa"]);

        let mut out = Vec::<u8>::new();
        let mut err = Vec::<u8>::new();
        let result = run_with_io(
            options,
            &factory,
            std::future::pending(),
            &mut out,
            &mut err,
        )
        .await;

        assert!(result.is_err());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn run_publishes_fixed_location_until_shutdown() {
        let factory = ScriptedFactory::new(Vec::new());
        let options = options(&["--location", "60.5,24.25,8", "--location-interval", "10ms"]);

        let mut out = Vec::<u8>::new();
        let mut err = Vec::<u8>::new();
        run_with_io(
            options,
            &factory,
            time::sleep(Duration::from_millis(50)),
            &mut out,
            &mut err,
        )
        .await
        .unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.lines().count() >= 1);
        assert!(
            out.lines()
                .all(|l| l.starts_with("proximity_location accuracy=8,latitude=60.5,longitude=24.25 "))
        );
    }

    #[tokio::test]
    async fn run_scans_without_location_by_default() {
        let factory = ScriptedFactory::new(Vec::new());

        let mut out = Vec::<u8>::new();
        let mut err = Vec::<u8>::new();
        run_with_io(
            options(&[]),
            &factory,
            time::sleep(Duration::from_millis(20)),
            &mut out,
            &mut err,
        )
        .await
        .unwrap();

        assert!(out.is_empty());
        assert!(err.is_empty());
    }

    #[tokio::test]
    async fn run_requires_location_service_when_asked() {
        let factory = ScriptedFactory::new(Vec::new());

        let mut out = Vec::<u8>::new();
        let mut err = Vec::<u8>::new();
        let result = run_with_io(
            options(&["--require-location"]),
            &factory,
            std::future::pending(),
            &mut out,
            &mut err,
        )
        .await;

        assert!(matches!(
            result,
            Err(RunError::Session(SessionError::PreconditionNotMet {
                which: Precondition::LocationService
            }))
        ));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn run_reports_driver_open_failure() {
        let mut out = Vec::<u8>::new();
        let mut err = Vec::<u8>::new();
        let result = run_with_io(
            options(&[]),
            &BrokenFactory,
            std::future::pending(),
            &mut out,
            &mut err,
        )
        .await;

        assert!(matches!(
            result,
            Err(RunError::Driver(DriverError::BackendNotAvailable(_)))
        ));
    }
}

//! BlueZ D-Bus radio driver.
//!
//! This backend uses the `bluer` crate to run LE discovery through the BlueZ
//! daemon. It requires the `bluetoothd` daemon to be running.

use super::{
    DriverAck, DriverError, DriverEvent, DriverSink, RadioDriver, SampleBatcher, ScanSettings,
    failure,
};
use crate::identity::MacAddress;
use crate::sample::SignalSample;
use crate::service_uuid::ServiceUuid;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, DiscoveryFilter, DiscoveryTransport,
    ErrorKind, Session,
};
use futures::{StreamExt, pin_mut};
use log::{debug, info, warn};
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time;

/// Shortest batch flush period; also used when batching is off.
const MIN_FLUSH_PERIOD: Duration = Duration::from_millis(10);

impl From<bluer::Error> for DriverError {
    fn from(err: bluer::Error) -> Self {
        DriverError::Bluetooth(err.to_string())
    }
}

/// Map a BlueZ error to a scan failure code.
fn failure_code(err: &bluer::Error) -> i32 {
    match err.kind {
        ErrorKind::InProgress | ErrorKind::AlreadyExists => failure::SCAN_FAILED_ALREADY_STARTED,
        ErrorKind::NotAuthorized | ErrorKind::NotPermitted => {
            failure::SCAN_FAILED_APPLICATION_REGISTRATION_FAILED
        }
        ErrorKind::NotSupported => failure::SCAN_FAILED_FEATURE_UNSUPPORTED,
        _ => failure::SCAN_FAILED_INTERNAL_ERROR,
    }
}

/// Radio driver backed by BlueZ discovery.
///
/// Discovery runs on a task that owns the D-Bus session. The driver
/// acknowledges a start with [`DriverAck::Pending`] and posts
/// [`DriverEvent::Started`] once BlueZ accepted the discovery request.
#[derive(Debug)]
pub struct BluerDriver {
    sink: DriverSink,
    task: Option<JoinHandle<()>>,
}

impl BluerDriver {
    pub fn new(sink: DriverSink) -> Self {
        Self { sink, task: None }
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl RadioDriver for BluerDriver {
    fn start_discovery(&mut self, settings: &ScanSettings) -> Result<DriverAck, DriverError> {
        let runtime = Handle::try_current()
            .map_err(|e| DriverError::Bluetooth(format!("no async runtime: {e}")))?;

        self.abort();
        let sink = self.sink.clone();
        let settings = settings.clone();
        self.task = Some(runtime.spawn(async move {
            if let Err(e) = discover(&sink, settings).await {
                warn!("BlueZ discovery failed: {e}");
                sink.post(DriverEvent::Failed {
                    code: failure_code(&e),
                })
                .await;
            }
        }));
        Ok(DriverAck::Pending)
    }

    fn stop_discovery(&mut self) -> Result<DriverAck, DriverError> {
        // dropping the discovery stream ends the BlueZ discovery session
        self.abort();
        Ok(DriverAck::Confirmed)
    }
}

impl Drop for BluerDriver {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Run discovery until the stream ends or the engine goes away.
async fn discover(sink: &DriverSink, settings: ScanSettings) -> bluer::Result<()> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;

    if !adapter.is_powered().await? {
        info!("adapter {} is powered off", adapter.name());
        sink.post(DriverEvent::AdapterPowered(false)).await;
        return Ok(());
    }

    let filter = DiscoveryFilter {
        transport: DiscoveryTransport::Le,
        duplicate_data: true,
        ..Default::default()
    };
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        warn!("could not restrict discovery to LE: {e}");
    }

    let events = adapter.discover_devices_with_changes().await?;
    pin_mut!(events);
    if !sink.post(DriverEvent::Started).await {
        return Ok(());
    }
    debug!("discovery running on {}", adapter.name());

    let mut batcher = SampleBatcher::new(settings);
    let mut flush = time::interval(batcher.report_delay().max(MIN_FLUSH_PERIOD));

    loop {
        let ready = tokio::select! {
            event = events.next() => match event {
                Some(AdapterEvent::DeviceAdded(address)) => {
                    match read_sample(&adapter, address).await {
                        Ok(Some(sample)) => batcher.push(sample),
                        Ok(None) => None,
                        Err(e) => {
                            debug!("skipping {address}: {e}");
                            None
                        }
                    }
                }
                Some(AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered))) => {
                    Some(DriverEvent::AdapterPowered(powered))
                }
                Some(_) => None,
                None => break,
            },
            _ = flush.tick() => batcher.flush(),
        };

        if let Some(event) = ready
            && !sink.post(event).await
        {
            return Ok(());
        }
    }

    warn!("BlueZ ended discovery on {}", adapter.name());
    sink.post(DriverEvent::Failed {
        code: failure::SCAN_FAILED_INTERNAL_ERROR,
    })
    .await;
    Ok(())
}

/// Read the advertised properties of a discovered device.
///
/// Devices without a current RSSI were not heard by the radio and yield `None`.
async fn read_sample(adapter: &Adapter, address: Address) -> bluer::Result<Option<SignalSample>> {
    let device = adapter.device(address)?;
    let Some(rssi) = device.rssi().await? else {
        return Ok(None);
    };

    let mut sample = SignalSample::new(MacAddress::from(address), rssi, SystemTime::now());
    if let Some(name) = device.name().await? {
        sample = sample.with_name(name);
    }
    if let Some(tx_power) = device.tx_power().await? {
        sample = sample.with_tx_power(tx_power);
    }
    if let Some(uuids) = device.uuids().await? {
        for uuid in uuids {
            sample = sample.with_service(ServiceUuid::from(uuid));
        }
    }
    Ok(Some(sample))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bluez_error(kind: ErrorKind) -> bluer::Error {
        bluer::Error {
            kind,
            message: String::new(),
        }
    }

    #[test]
    fn test_failure_codes() {
        assert_eq!(
            failure_code(&bluez_error(ErrorKind::InProgress)),
            failure::SCAN_FAILED_ALREADY_STARTED
        );
        assert_eq!(
            failure_code(&bluez_error(ErrorKind::NotPermitted)),
            failure::SCAN_FAILED_APPLICATION_REGISTRATION_FAILED
        );
        assert_eq!(
            failure_code(&bluez_error(ErrorKind::NotSupported)),
            failure::SCAN_FAILED_FEATURE_UNSUPPORTED
        );
        assert_eq!(
            failure_code(&bluez_error(ErrorKind::Failed)),
            failure::SCAN_FAILED_INTERNAL_ERROR
        );
    }

    #[test]
    fn test_address_to_mac_address() {
        let addr = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let mac: MacAddress = addr.into();
        assert_eq!(mac, MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
    }

    #[test]
    fn test_start_outside_runtime_is_an_error() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let mut driver = BluerDriver::new(DriverSink::new(tx));
        assert!(matches!(
            driver.start_discovery(&ScanSettings::default()),
            Err(DriverError::Bluetooth(_))
        ));
    }
}

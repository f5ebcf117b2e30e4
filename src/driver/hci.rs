//! Raw HCI socket radio driver.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.

use super::{
    DriverAck, DriverError, DriverEvent, DriverSink, RadioDriver, SampleBatcher, ScanSettings,
    failure,
};
use crate::identity::MacAddress;
use crate::sample::SignalSample;
use crate::service_uuid::ServiceUuid;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use log::{debug, warn};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, SystemTime};
use tokio::io::unix::AsyncFd;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;

// HCI packet types
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Active scanning asks for scan responses, which is where most names live
const LE_SCAN_ACTIVE: u8 = 0x01;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

// AD types
const AD_TYPE_INCOMPLETE_UUID16: u8 = 0x02;
const AD_TYPE_COMPLETE_UUID16: u8 = 0x03;
const AD_TYPE_INCOMPLETE_UUID32: u8 = 0x04;
const AD_TYPE_COMPLETE_UUID32: u8 = 0x05;
const AD_TYPE_INCOMPLETE_UUID128: u8 = 0x06;
const AD_TYPE_COMPLETE_UUID128: u8 = 0x07;
const AD_TYPE_SHORT_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
const AD_TYPE_TX_POWER: u8 = 0x0A;

/// RSSI value meaning the controller could not measure it.
const RSSI_UNAVAILABLE: i8 = 127;

/// Max HCI event size
const EVENT_BUFFER_SIZE: usize = 258;

const MIN_FLUSH_PERIOD: Duration = Duration::from_millis(10);

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// LE Set Scan Parameters: active scan, 10ms interval and window.
fn scan_parameters_packet() -> Vec<u8> {
    // interval and window in 0.625ms units
    let interval: u16 = 0x0010;
    let window: u16 = 0x0010;

    let mut params = Vec::with_capacity(7);
    params.push(LE_SCAN_ACTIVE);
    params.extend_from_slice(&interval.to_le_bytes());
    params.extend_from_slice(&window.to_le_bytes());
    params.push(LE_PUBLIC_ADDRESS);
    params.push(FILTER_POLICY_ACCEPT_ALL);
    hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, &params)
}

/// LE Set Scan Enable, never filtering duplicates so RSSI keeps updating.
fn scan_enable_packet(enable: bool) -> Vec<u8> {
    hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[u8::from(enable), 0x00])
}

fn os_error(what: &str) -> DriverError {
    DriverError::Bluetooth(format!("{what}: {}", io::Error::last_os_error()))
}

/// Open a raw HCI socket
fn open_hci_socket() -> Result<OwnedFd, DriverError> {
    // SOCK_NONBLOCK is required for AsyncFd to work properly
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };

    if fd < 0 {
        return Err(os_error("Failed to create HCI socket"));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind HCI socket to a device
fn bind_hci_socket(fd: &OwnedFd, dev_id: u16) -> Result<(), DriverError> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: 0, // HCI_CHANNEL_RAW
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(os_error("Failed to bind HCI socket"));
    }

    Ok(())
}

/// Only pass LE meta events to the socket
fn set_hci_filter(fd: &OwnedFd) -> Result<(), DriverError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            0, // SOL_HCI
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(os_error("Failed to set HCI filter"));
    }

    Ok(())
}

fn send_hci_command(fd: &OwnedFd, packet: &[u8]) -> Result<(), DriverError> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };

    if ret < 0 {
        return Err(os_error("Failed to send HCI command"));
    }

    Ok(())
}

/// Iterator over the `(type, payload)` structures of advertising data.
///
/// Stops at the first zero-length or truncated structure.
struct AdStructures<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for AdStructures<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let (&len, rest) = self.data.split_first()?;
        let len = len as usize;
        if len == 0 || rest.len() < len {
            self.data = &[];
            return None;
        }
        let (structure, remaining) = rest.split_at(len);
        self.data = remaining;
        Some((structure[0], &structure[1..]))
    }
}

/// Build a sample from one advertisement's AD structures.
fn sample_from_advertisement(
    address: MacAddress,
    rssi: i16,
    ad_data: &[u8],
    observed_at: SystemTime,
) -> SignalSample {
    let mut sample = SignalSample::new(address, rssi, observed_at);

    for (ad_type, payload) in (AdStructures { data: ad_data }) {
        match ad_type {
            AD_TYPE_COMPLETE_NAME => {
                sample.display_name = Some(String::from_utf8_lossy(payload).into_owned());
            }
            AD_TYPE_SHORT_NAME if sample.display_name.is_none() => {
                sample.display_name = Some(String::from_utf8_lossy(payload).into_owned());
            }
            AD_TYPE_TX_POWER => {
                if let Some(&level) = payload.first() {
                    sample.tx_power = Some(i16::from(level as i8));
                }
            }
            AD_TYPE_INCOMPLETE_UUID16 | AD_TYPE_COMPLETE_UUID16 => {
                for chunk in payload.chunks_exact(2) {
                    let short = u16::from_le_bytes([chunk[0], chunk[1]]);
                    sample = sample.with_service(ServiceUuid::from_u16(short));
                }
            }
            AD_TYPE_INCOMPLETE_UUID32 | AD_TYPE_COMPLETE_UUID32 => {
                for chunk in payload.chunks_exact(4) {
                    let short = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    sample = sample.with_service(ServiceUuid::from_u32(short));
                }
            }
            AD_TYPE_INCOMPLETE_UUID128 | AD_TYPE_COMPLETE_UUID128 => {
                for uuid in payload.chunks_exact(16).filter_map(ServiceUuid::from_le_slice) {
                    sample = sample.with_service(uuid);
                }
            }
            _ => {}
        }
    }

    sample
}

/// Parse every report in an LE advertising report event.
///
/// `packet` starts at the HCI packet type byte. Reports are laid out one after
/// another: event type, address type, address, data length, data, RSSI.
/// Parsing stops at the first truncated report.
fn parse_advertising_event(packet: &[u8], observed_at: SystemTime) -> Vec<SignalSample> {
    let Some([HCI_EVENT_PKT, EVT_LE_META_EVENT, _, EVT_LE_ADVERTISING_REPORT, count]) =
        packet.get(..5)
    else {
        return Vec::new();
    };

    let mut rest = &packet[5..];
    let mut samples = Vec::with_capacity(*count as usize);
    for _ in 0..*count {
        // event type(1) + address type(1) + address(6) + data length(1)
        if rest.len() < 9 {
            break;
        }
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&rest[2..8]);
        let data_len = rest[8] as usize;
        let Some(ad_data) = rest.get(9..9 + data_len) else {
            break;
        };
        let Some(&rssi) = rest.get(9 + data_len) else {
            break;
        };
        rest = &rest[10 + data_len..];

        let rssi = rssi as i8;
        if rssi == RSSI_UNAVAILABLE {
            continue;
        }
        samples.push(sample_from_advertisement(
            MacAddress::from_le_bytes(addr),
            i16::from(rssi),
            ad_data,
            observed_at,
        ));
    }
    samples
}

/// Radio driver on a raw HCI socket.
///
/// Scan enable and disable are plain HCI commands, so both requests are
/// acknowledged with [`DriverAck::Confirmed`].
#[derive(Debug)]
pub struct HciDriver {
    dev_id: u16,
    sink: DriverSink,
    cmd_fd: Option<OwnedFd>,
    task: Option<JoinHandle<()>>,
}

impl HciDriver {
    /// Driver for controller `hci<dev_id>`.
    pub fn new(dev_id: u16, sink: DriverSink) -> Self {
        Self {
            dev_id,
            sink,
            cmd_fd: None,
            task: None,
        }
    }

    fn halt(&mut self) -> Result<(), DriverError> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        match self.cmd_fd.take() {
            Some(fd) => send_hci_command(&fd, &scan_enable_packet(false)),
            None => Ok(()),
        }
    }
}

impl RadioDriver for HciDriver {
    fn start_discovery(&mut self, settings: &ScanSettings) -> Result<DriverAck, DriverError> {
        let runtime = Handle::try_current()
            .map_err(|e| DriverError::Bluetooth(format!("no async runtime: {e}")))?;
        if let Err(e) = self.halt() {
            debug!("disabling previous scan: {e}");
        }

        // Event socket for reading advertising reports
        let fd = open_hci_socket()?;
        bind_hci_socket(&fd, self.dev_id)?;
        set_hci_filter(&fd)?;

        // Separate socket for sending commands
        let cmd_fd = open_hci_socket()?;
        bind_hci_socket(&cmd_fd, self.dev_id)?;
        send_hci_command(&cmd_fd, &scan_parameters_packet())?;
        send_hci_command(&cmd_fd, &scan_enable_packet(true))?;

        let async_fd = {
            let _guard = runtime.enter();
            AsyncFd::new(fd)
                .map_err(|e| DriverError::Bluetooth(format!("Failed to create async fd: {e}")))?
        };

        self.cmd_fd = Some(cmd_fd);
        self.task = Some(runtime.spawn(read_reports(
            async_fd,
            self.sink.clone(),
            settings.clone(),
        )));
        debug!("HCI scan enabled on hci{}", self.dev_id);
        Ok(DriverAck::Confirmed)
    }

    fn stop_discovery(&mut self) -> Result<DriverAck, DriverError> {
        self.halt()?;
        Ok(DriverAck::Confirmed)
    }
}

impl Drop for HciDriver {
    fn drop(&mut self) {
        if let Err(e) = self.halt() {
            warn!("could not disable scan on hci{}: {e}", self.dev_id);
        }
    }
}

/// Read HCI events and post samples until the socket fails or the engine goes away.
async fn read_reports(async_fd: AsyncFd<OwnedFd>, sink: DriverSink, settings: ScanSettings) {
    let mut batcher = SampleBatcher::new(settings);
    let mut flush = time::interval(batcher.report_delay().max(MIN_FLUSH_PERIOD));
    let mut buf = [0u8; EVENT_BUFFER_SIZE];

    loop {
        let mut ready = Vec::new();

        tokio::select! {
            guard = async_fd.readable() => {
                let Ok(mut guard) = guard else { break };

                // Drain all available packets before waiting again
                loop {
                    let n = match guard.try_io(|inner| {
                        let ret = unsafe {
                            libc::read(
                                inner.as_raw_fd(),
                                buf.as_mut_ptr() as *mut c_void,
                                buf.len(),
                            )
                        };
                        if ret < 0 {
                            Err(io::Error::last_os_error())
                        } else {
                            Ok(ret as usize)
                        }
                    }) {
                        Ok(Ok(n)) if n > 0 => n,
                        Ok(Ok(_)) => break,  // EOF or empty read
                        Ok(Err(_)) => break, // Read error
                        Err(_) => break,     // WouldBlock - no more data
                    };

                    let observed_at = SystemTime::now();
                    for sample in parse_advertising_event(&buf[..n], observed_at) {
                        ready.extend(batcher.push(sample));
                    }
                }
            }
            _ = flush.tick() => ready.extend(batcher.flush()),
        }

        for event in ready {
            if !sink.post(event).await {
                return;
            }
        }
    }

    warn!("HCI event socket closed");
    sink.post(DriverEvent::Failed {
        code: failure::SCAN_FAILED_INTERNAL_ERROR,
    })
    .await;
}

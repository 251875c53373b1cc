/* Simulated G502: a loopback transport with its own register model.
 *
 * Set commands update the registers, get commands are answered with long
 * frames on the inbound path, exactly where a real device's interrupt
 * reports would land. Every command is also followed by the empty
 * acknowledgement the real device produces. Used by the test-suite and,
 * with the dev-hooks feature, by the Manager's LoadTestDevice method. */

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::driver::g502::{
    DPI_FN_GET, DPI_FN_SET, FEATURE_DEVICE_FW, FEATURE_DPI, FEATURE_ONBOARD_PROFILES,
    FEATURE_REPORT_RATE, FW_FN_GET_INFO, MAX_DPI, ONBOARD_FN_SET_MODE, ONBOARD_MODE_DEVICE,
    ONBOARD_MODE_HOST, RATE_FN_GET, RATE_FN_SET, RateTable,
};
use crate::driver::hidpp::{DEVICE_IDX_DIRECT, HIDPP20_ERROR, LONG_SIZE, REPORT_ID_LONG, Response};
use crate::driver::{Transport, TransportError};

/* HID++ 2.0 error codes the simulation answers with */
const ERR_INVALID_ARGUMENT: u8 = 0x02;
const ERR_INVALID_FUNCTION: u8 = 0x07;

type InboundSink = Box<dyn FnMut(&[u8]) + Send>;

/// Firmware identity reported by the firmware-info feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    pub prefix: [u8; 3],
    pub major: u8,
    pub minor: u8,
    pub build: u16,
}

impl Default for Firmware {
    fn default() -> Self {
        Self {
            prefix: *b"U1 ",
            major: 0x12,
            minor: 0x03,
            build: 0x0011,
        }
    }
}

#[derive(Debug)]
struct Registers {
    report_rate: u8,
    dpi: u16,
    onboard_mode: u8,
    firmware: Firmware,
    /* Feature indices answered with an error instead of data */
    rejected: Vec<u8>,
}

pub struct SimulatedG502 {
    name: String,
    registers: Mutex<Registers>,
    inbound: Mutex<Option<InboundSink>>,
    connected: AtomicBool,
    received: AtomicU64,
}

impl SimulatedG502 {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            registers: Mutex::new(Registers {
                report_rate: RateTable::to_device(1000),
                dpi: 1600,
                onboard_mode: ONBOARD_MODE_DEVICE,
                firmware: Firmware::default(),
                rejected: Vec::new(),
            }),
            inbound: Mutex::new(None),
            connected: AtomicBool::new(true),
            received: AtomicU64::new(0),
        }
    }

    pub fn with_registers(self, report_rate_hz: u16, dpi: u16) -> Self {
        {
            let mut regs = self.registers.lock();
            regs.report_rate = RateTable::to_device(report_rate_hz);
            regs.dpi = dpi;
        }
        self
    }

    pub fn with_firmware(self, firmware: Firmware) -> Self {
        self.registers.lock().firmware = firmware;
        self
    }

    /// Make the device answer every request for `feature` with an error.
    pub fn reject_feature(&self, feature: u8) {
        self.registers.lock().rejected.push(feature);
    }

    /// Route replies to `sink`, replacing any previous one.
    pub fn connect_inbound<F>(&self, sink: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        *self.inbound.lock() = Some(Box::new(sink));
    }

    /// Simulate unplugging: every later send fails.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn report_rate_hz(&self) -> u16 {
        RateTable::to_host(self.registers.lock().report_rate)
    }

    pub fn dpi(&self) -> u16 {
        self.registers.lock().dpi
    }

    pub fn is_host_mode(&self) -> bool {
        self.registers.lock().onboard_mode == ONBOARD_MODE_HOST
    }

    /// Number of commands accepted so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    fn execute(&self, feature: u8, function: u8, params: &[u8]) -> Result<Vec<u8>, u8> {
        let mut regs = self.registers.lock();
        if regs.rejected.contains(&feature) {
            return Err(ERR_INVALID_ARGUMENT);
        }

        match (feature, function) {
            (FEATURE_REPORT_RATE, RATE_FN_SET) => {
                if RateTable::to_host(params[0]) == 0 {
                    return Err(ERR_INVALID_ARGUMENT);
                }
                regs.report_rate = params[0];
                Ok(Vec::new())
            }
            (FEATURE_REPORT_RATE, RATE_FN_GET) => Ok(vec![regs.report_rate]),
            (FEATURE_DPI, DPI_FN_SET) => {
                let dpi = u16::from_be_bytes([params[1], params[2]]);
                if dpi == 0 || dpi > MAX_DPI {
                    return Err(ERR_INVALID_ARGUMENT);
                }
                regs.dpi = dpi;
                Ok(Vec::new())
            }
            (FEATURE_DPI, DPI_FN_GET) => {
                let [hi, lo] = regs.dpi.to_be_bytes();
                Ok(vec![params[0], hi, lo])
            }
            (FEATURE_ONBOARD_PROFILES, ONBOARD_FN_SET_MODE) => {
                regs.onboard_mode = params[0];
                Ok(Vec::new())
            }
            (FEATURE_DEVICE_FW, FW_FN_GET_INFO) => {
                let fw = &regs.firmware;
                let [build_hi, build_lo] = fw.build.to_be_bytes();
                let mut reply = vec![params[0]];
                reply.extend_from_slice(&fw.prefix);
                reply.extend_from_slice(&[fw.major, fw.minor, build_hi, build_lo]);
                Ok(reply)
            }
            _ => Err(ERR_INVALID_FUNCTION),
        }
    }

    fn deliver(&self, report: &[u8]) {
        if let Some(sink) = self.inbound.lock().as_mut() {
            sink(report);
        }
    }
}

fn long_frame(header: [u8; 4], params: &[u8]) -> [u8; LONG_SIZE] {
    let mut frame = [0u8; LONG_SIZE];
    frame[..4].copy_from_slice(&header);
    frame[4..4 + params.len()].copy_from_slice(params);
    frame
}

impl Transport for SimulatedG502 {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_blocking(&self, _report_id: u8, report: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::Disconnected);
        }
        let request = Response::parse(report)
            .ok_or_else(|| TransportError::Rejected(format!("malformed report {report:02x?}")))?;
        self.received.fetch_add(1, Ordering::Relaxed);

        let (feature, function) = (request.feature_index(), request.function());
        let selector = report[3];
        let reply = match self.execute(feature, function, request.params()) {
            Ok(params) => long_frame([REPORT_ID_LONG, DEVICE_IDX_DIRECT, feature, selector], &params),
            Err(code) => {
                debug!("{}: rejecting feature 0x{feature:02x} fn {function}", self.name);
                long_frame(
                    [REPORT_ID_LONG, DEVICE_IDX_DIRECT, HIDPP20_ERROR, feature],
                    &[selector, code],
                )
            }
        };

        self.deliver(&[]);
        self.deliver(&reply);
        Ok(())
    }
}

/// JSON description of a simulated device, as accepted by LoadTestDevice.
///
/// Every field is optional:
///
/// ```json
/// { "name": "bench mouse", "report_rate": 500, "dpi": 2400,
///   "firmware": { "prefix": "U1 ", "major": 18, "minor": 3, "build": 17 },
///   "reject_features": [11] }
/// ```
#[cfg(any(test, feature = "dev-hooks"))]
pub mod spec {
    use serde::Deserialize;

    use super::{Firmware, SimulatedG502};

    #[derive(Debug, Deserialize)]
    #[serde(default)]
    pub struct TestDeviceSpec {
        pub name: String,
        /// Report rate in Hz.
        pub report_rate: u16,
        pub dpi: u16,
        pub firmware: TestFirmwareSpec,
        pub reject_features: Vec<u8>,
    }

    impl Default for TestDeviceSpec {
        fn default() -> Self {
            Self {
                name: "Simulated G502 HERO".to_string(),
                report_rate: 1000,
                dpi: 1600,
                firmware: TestFirmwareSpec::default(),
                reject_features: Vec::new(),
            }
        }
    }

    #[derive(Debug, Deserialize)]
    #[serde(default)]
    pub struct TestFirmwareSpec {
        pub prefix: String,
        pub major: u8,
        pub minor: u8,
        pub build: u16,
    }

    impl Default for TestFirmwareSpec {
        fn default() -> Self {
            let fw = Firmware::default();
            Self {
                prefix: String::from_utf8_lossy(&fw.prefix).into_owned(),
                major: fw.major,
                minor: fw.minor,
                build: fw.build,
            }
        }
    }

    impl TestFirmwareSpec {
        fn to_firmware(&self) -> Firmware {
            let mut prefix = *b"   ";
            for (dst, src) in prefix.iter_mut().zip(self.prefix.bytes()) {
                *dst = src;
            }
            Firmware {
                prefix,
                major: self.major,
                minor: self.minor,
                build: self.build,
            }
        }
    }

    /// Parse a JSON string into a [`TestDeviceSpec`].
    ///
    /// An empty string produces the defaults.
    pub fn parse_json(json: &str) -> Result<TestDeviceSpec, serde_json::Error> {
        if json.trim().is_empty() {
            return Ok(TestDeviceSpec::default());
        }
        serde_json::from_str(json)
    }

    /// Build the simulated device described by `spec`.
    pub fn build_device(sysname: &str, spec: &TestDeviceSpec) -> SimulatedG502 {
        let device = SimulatedG502::new(sysname)
            .with_registers(spec.report_rate, spec.dpi)
            .with_firmware(spec.firmware.to_firmware());
        for &feature in &spec.reject_features {
            device.reject_feature(feature);
        }
        device
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::spec::{build_device, parse_json};
    use super::*;
    use crate::config::DaemonConfig;
    use crate::correlator::{Correlation, RawEvent};
    use crate::session::DeviceSession;

    /* Attach a protocol session to a fresh simulated device with its */
    /* replies wired back into the session's router. */
    fn attach(device: SimulatedG502) -> (Arc<SimulatedG502>, DeviceSession, Arc<Mutex<Vec<RawEvent>>>) {
        let device = Arc::new(device);
        let session = DeviceSession::attach("sim", device.clone(), true, &DaemonConfig::default())
            .expect("attach");

        let events = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&events);
        let mut router = session.router(None, || {});
        device.connect_inbound(move |buf| log.lock().push(router.deliver(buf)));
        (device, session, events)
    }

    #[test]
    fn apply_is_confirmed_by_read_back() {
        let (device, session, events) = attach(SimulatedG502::new("sim"));
        session
            .controller()
            .apply(Some(500), Some(2400), None)
            .expect("valid");
        let controller = Arc::clone(session.controller());
        session.detach();

        assert_eq!(device.report_rate_hz(), 500);
        assert_eq!(device.dpi(), 2400);
        assert!(device.is_host_mode());

        let current = controller.state().current();
        assert_eq!((current.report_rate_hz, current.dpi), (500, 2400));

        let events = events.lock();
        assert!(events.contains(&RawEvent::Protocol(Correlation::ReportRate(500))));
        assert!(events.contains(&RawEvent::Protocol(Correlation::Dpi(2400))));
        assert!(events.contains(&RawEvent::NotProtocol));
    }

    #[test]
    fn three_switches_push_profile_three_to_the_device() {
        let (device, session, _) = attach(SimulatedG502::new("sim"));
        for _ in 0..3 {
            session.controller().switch_profile().expect("switch");
        }
        let controller = Arc::clone(session.controller());
        session.detach();

        let current = controller.state().current();
        assert_eq!(current.index, 3);
        assert_eq!((current.report_rate_hz, current.dpi), (1000, 3200));
        assert_eq!((device.report_rate_hz(), device.dpi()), (1000, 3200));
    }

    #[test]
    fn firmware_reply_is_decoded() {
        let (_, session, events) = attach(SimulatedG502::new("sim"));
        session.detach();

        let fw = Firmware::default();
        assert!(events.lock().contains(&RawEvent::Protocol(Correlation::FirmwareInfo {
            entity_type: 0,
            major: fw.major,
            minor: fw.minor,
            build: fw.build,
        })));
    }

    #[test]
    fn rejected_feature_surfaces_as_device_error() {
        let device = SimulatedG502::new("sim");
        device.reject_feature(FEATURE_DPI);
        let (device, session, events) = attach(device);
        session.controller().apply(None, Some(3200), None).expect("queued");
        session.detach();

        assert_eq!(device.dpi(), 1600);
        assert!(events.lock().contains(&RawEvent::Protocol(Correlation::DeviceError {
            feature: FEATURE_DPI,
            function: DPI_FN_SET,
            code: ERR_INVALID_ARGUMENT,
        })));
    }

    #[test]
    fn failed_sends_keep_intended_state() {
        let device = SimulatedG502::new("sim");
        device.set_connected(false);
        let (device, session, _) = attach(device);
        session.controller().apply(Some(250), None, None).expect("queued");
        let controller = Arc::clone(session.controller());
        session.detach();

        assert_eq!(device.report_rate_hz(), 1000);
        assert_eq!(device.received(), 0);
        assert_eq!(controller.state().current().report_rate_hz, 250);
        /* host mode, firmware query, then the set/get pair */
        assert_eq!(controller.stats().failed(), 4);
        assert_eq!(controller.stats().sent(), 0);
    }

    #[test]
    fn spec_parsing_and_defaults() {
        let spec = parse_json("").expect("empty is valid");
        assert_eq!(spec.report_rate, 1000);

        let spec = parse_json(r#"{ "dpi": 2400, "report_rate": 500, "reject_features": [11] }"#)
            .expect("valid json");
        let device = build_device("sim", &spec);
        assert_eq!((device.report_rate_hz(), device.dpi()), (500, 2400));
        assert_eq!(spec.firmware.prefix, "U1 ");

        assert!(parse_json("{ \"dpi\": \"fast\" }").is_err());
    }
}

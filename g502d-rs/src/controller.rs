/* Configuration intents: validates human units, records the intended
 * profile values and queues the matching set/get command pairs. */

use thiserror::Error;
use tracing::{debug, info};

use crate::device::{DeviceState, Profile, Rgb};
use crate::dispatch::{DispatchError, DispatchHandle, TransmitStats};
use crate::driver::g502::{self, FirmwareEntity, MAX_DPI, ONBOARD_MODE_HOST, RateTable};
use crate::driver::hidpp::{CodecError, Packet};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unsupported report rate {0} Hz (expected 125, 250, 500 or 1000)")]
    UnsupportedReportRate(u16),

    #[error("DPI {0} out of range (1..=25600)")]
    DpiOutOfRange(u16),

    #[error("Interface does not carry protocol commands")]
    ProtocolUnsupported,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/* A validated report rate: host units plus the wire byte. */
#[derive(Debug, Clone, Copy)]
struct ReportRate {
    hz: u16,
    raw: u8,
}

/* Zero means "leave unchanged" for both rate and DPI. */
fn validate_report_rate(hz: Option<u16>) -> Result<Option<ReportRate>, ConfigError> {
    match hz {
        None | Some(0) => Ok(None),
        Some(hz) => match RateTable::to_device(hz) {
            0 => Err(ConfigError::UnsupportedReportRate(hz)),
            raw => Ok(Some(ReportRate { hz, raw })),
        },
    }
}

fn validate_dpi(dpi: Option<u16>) -> Result<Option<u16>, ConfigError> {
    match dpi {
        None | Some(0) => Ok(None),
        Some(dpi) if dpi > MAX_DPI => Err(ConfigError::DpiOutOfRange(dpi)),
        Some(dpi) => Ok(Some(dpi)),
    }
}

pub struct DeviceConfigController {
    state: DeviceState,
    dispatch: DispatchHandle,
    supports_protocol: bool,
}

impl DeviceConfigController {
    pub fn new(state: DeviceState, dispatch: DispatchHandle, supports_protocol: bool) -> Self {
        Self {
            state,
            dispatch,
            supports_protocol,
        }
    }

    pub fn supports_protocol(&self) -> bool {
        self.supports_protocol
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn stats(&self) -> &TransmitStats {
        self.dispatch.stats()
    }

    fn ensure_protocol(&self) -> Result<(), ConfigError> {
        if self.supports_protocol {
            Ok(())
        } else {
            Err(ConfigError::ProtocolUnsupported)
        }
    }

    /* Push the given fields to the device.
     *
     * Every present field is validated before anything is built or stored.
     * Queue space for the whole batch is then reserved; only when that holds
     * are the intended values written into the current profile and a set
     * command followed by a get command queued for each field, so the
     * correlator refreshes the profile once the device answers. A refused
     * batch leaves the profile untouched. The colour is only recorded;
     * lighting is never sent to the device.
     *
     * Returns once the commands are queued. A send that later fails leaves
     * the profile holding the intended values. */
    pub fn apply(
        &self,
        report_rate_hz: Option<u16>,
        dpi: Option<u16>,
        rgb: Option<u32>,
    ) -> Result<(), ConfigError> {
        self.ensure_protocol()?;

        let rate = validate_report_rate(report_rate_hz)?;
        let dpi = validate_dpi(dpi)?;
        let rgb = rgb.map(Rgb::from_u32);
        let packets = Self::build_packets(rate, dpi)?;

        self.dispatch.submit_all(packets, || {
            let mut store = self.state.lock();
            let profile = store.current_mut();
            if let Some(rate) = rate {
                profile.report_rate_hz = rate.hz;
            }
            if let Some(dpi) = dpi {
                profile.dpi = dpi;
            }
            if let Some(rgb) = rgb {
                profile.rgb = rgb;
                debug!("Profile {} colour set to {:06x} (not sent)", profile.index, rgb.to_u32());
            }
        })?;
        Ok(())
    }

    fn build_packets(rate: Option<ReportRate>, dpi: Option<u16>) -> Result<Vec<Packet>, ConfigError> {
        let mut packets = Vec::with_capacity(4);
        if let Some(rate) = rate {
            packets.push(g502::set_report_rate(rate.raw)?);
            packets.push(g502::get_report_rate()?);
        }
        if let Some(dpi) = dpi {
            packets.push(g502::set_dpi(dpi)?);
            packets.push(g502::get_dpi()?);
        }
        Ok(packets)
    }

    /* Select the next profile (wrapping) and push all of its fields. The */
    /* selection only moves once the whole batch is queued. */
    pub fn switch_profile(&self) -> Result<Profile, ConfigError> {
        self.ensure_protocol()?;

        let next = *self.state.lock().peek_next();
        let rate = validate_report_rate(Some(next.report_rate_hz))?;
        let dpi = validate_dpi(Some(next.dpi))?;
        let packets = Self::build_packets(rate, dpi)?;

        let mut selected = next;
        self.dispatch.submit_all(packets, || {
            selected = *self.state.lock().advance_current();
        })?;

        info!(
            "Switched to profile {} ({} Hz, {} DPI)",
            selected.index, selected.report_rate_hz, selected.dpi
        );
        Ok(selected)
    }

    /* Hand profile control to the host. Sent once at attach. */
    pub fn enter_host_mode(&self) -> Result<(), ConfigError> {
        self.ensure_protocol()?;
        self.dispatch.submit(g502::set_onboard_mode(ONBOARD_MODE_HOST)?)?;
        Ok(())
    }

    /* Ask for the main application firmware version. The reply is only logged. */
    pub fn query_firmware(&self) -> Result<(), ConfigError> {
        self.ensure_protocol()?;
        self.dispatch
            .submit(g502::get_firmware_info(FirmwareEntity::MainApp)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use std::sync::mpsc as std_mpsc;

    use parking_lot::Mutex;

    use super::*;
    use crate::device::default_profiles;
    use crate::dispatch::{DispatchWorker, spawn_dispatcher};
    use crate::driver::g502::{
        DPI_FN_GET, DPI_FN_SET, FEATURE_DPI, FEATURE_ONBOARD_PROFILES, FEATURE_REPORT_RATE,
        RATE_FN_GET, RATE_FN_SET,
    };
    use crate::driver::{Transport, TransportError};

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl Transport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        fn send_blocking(&self, _report_id: u8, report: &[u8]) -> Result<(), TransportError> {
            self.sent.lock().push(report.to_vec());
            Ok(())
        }
    }

    impl RecordingTransport {
        /* (feature, function, params[0..3]) of every frame sent so far */
        fn commands(&self) -> Vec<(u8, u8, [u8; 3])> {
            self.sent
                .lock()
                .iter()
                .map(|r| (r[2], r[3] >> 4, [r[4], r[5], r[6]]))
                .collect()
        }
    }

    fn controller(
        supports_protocol: bool,
    ) -> (Arc<RecordingTransport>, DeviceConfigController, DispatchWorker) {
        let transport = Arc::new(RecordingTransport::default());
        let (handle, worker) = spawn_dispatcher(transport.clone(), 16).expect("spawn");
        let state = DeviceState::new(default_profiles());
        (
            transport,
            DeviceConfigController::new(state, handle, supports_protocol),
            worker,
        )
    }

    #[test]
    fn apply_queues_set_then_get_per_field() {
        let (transport, controller, worker) = controller(true);
        controller.apply(Some(500), Some(3200), None).expect("valid");
        worker.shutdown();

        assert_eq!(
            transport.commands(),
            [
                (FEATURE_REPORT_RATE, RATE_FN_SET, [0x04, 0, 0]),
                (FEATURE_REPORT_RATE, RATE_FN_GET, [0, 0, 0]),
                (FEATURE_DPI, DPI_FN_SET, [0, 0x0C, 0x80]),
                (FEATURE_DPI, DPI_FN_GET, [0, 0, 0]),
            ]
        );
        let current = controller.state().current();
        assert_eq!(current.report_rate_hz, 500);
        assert_eq!(current.dpi, 3200);
    }

    #[test]
    fn unsupported_rate_is_rejected_before_anything_is_sent() {
        let (transport, controller, worker) = controller(true);
        let err = controller.apply(Some(300), Some(1600), None).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedReportRate(300)));
        worker.shutdown();

        assert!(transport.sent.lock().is_empty());
        assert_eq!(controller.state().current().dpi, 800);
    }

    #[test]
    fn dpi_above_limit_is_rejected() {
        let (transport, controller, worker) = controller(true);
        let err = controller.apply(None, Some(30000), None).unwrap_err();
        assert!(matches!(err, ConfigError::DpiOutOfRange(30000)));
        assert!(controller.apply(None, Some(MAX_DPI), None).is_ok());
        worker.shutdown();
        assert_eq!(transport.sent.lock().len(), 2);
    }

    #[test]
    fn zero_means_no_change() {
        let (transport, controller, worker) = controller(true);
        controller.apply(Some(0), Some(0), None).expect("no-op");
        worker.shutdown();

        assert!(transport.sent.lock().is_empty());
        let current = controller.state().current();
        assert_eq!((current.report_rate_hz, current.dpi), (125, 800));
    }

    #[test]
    fn colour_is_stored_but_never_sent() {
        let (transport, controller, worker) = controller(true);
        controller.apply(None, None, Some(0x00FF80)).expect("valid");
        worker.shutdown();

        assert!(transport.sent.lock().is_empty());
        assert_eq!(controller.state().current().rgb.to_u32(), 0x00FF80);
    }

    #[test]
    fn three_switches_select_profile_three() {
        let (transport, controller, worker) = controller(true);
        for _ in 0..3 {
            controller.switch_profile().expect("switch");
        }
        worker.shutdown();

        let current = controller.state().current();
        assert_eq!(current.index, 3);
        assert_eq!((current.report_rate_hz, current.dpi), (1000, 3200));

        /* The last two set commands carry profile 3's values */
        let sets: Vec<_> = transport
            .commands()
            .into_iter()
            .filter(|&(feature, function, _)| {
                (feature, function) == (FEATURE_REPORT_RATE, RATE_FN_SET)
                    || (feature, function) == (FEATURE_DPI, DPI_FN_SET)
            })
            .collect();
        assert_eq!(sets.len(), 6);
        assert_eq!(sets[4], (FEATURE_REPORT_RATE, RATE_FN_SET, [0x08, 0, 0]));
        assert_eq!(sets[5], (FEATURE_DPI, DPI_FN_SET, [0, 0x0C, 0x80]));
    }

    #[test]
    fn host_mode_and_firmware_requests() {
        let (transport, controller, worker) = controller(true);
        controller.enter_host_mode().expect("queued");
        controller.query_firmware().expect("queued");
        worker.shutdown();

        let commands = transport.commands();
        assert_eq!(commands[0], (FEATURE_ONBOARD_PROFILES, 0x01, [0x02, 0, 0]));
        assert_eq!(commands[1].0, g502::FEATURE_DEVICE_FW);
    }

    #[test]
    fn mouse_interface_refuses_every_intent() {
        let (transport, controller, worker) = controller(false);
        assert!(matches!(
            controller.apply(Some(1000), None, None),
            Err(ConfigError::ProtocolUnsupported)
        ));
        assert!(matches!(
            controller.switch_profile(),
            Err(ConfigError::ProtocolUnsupported)
        ));
        assert!(matches!(
            controller.enter_host_mode(),
            Err(ConfigError::ProtocolUnsupported)
        ));
        worker.shutdown();

        assert!(transport.sent.lock().is_empty());
        assert_eq!(controller.state().current().index, 0);
    }

    /* Holds the worker inside its first send until the test lets go. */
    struct GatedTransport {
        entered: Mutex<std_mpsc::Sender<()>>,
        gate: Mutex<std_mpsc::Receiver<()>>,
        sent: Mutex<Vec<(u8, u8)>>,
    }

    impl Transport for GatedTransport {
        fn name(&self) -> &str {
            "gated"
        }

        fn send_blocking(&self, _report_id: u8, report: &[u8]) -> Result<(), TransportError> {
            let _ = self.entered.lock().send(());
            let _ = self.gate.lock().recv();
            self.sent.lock().push((report[2], report[3] >> 4));
            Ok(())
        }
    }

    #[test]
    fn full_queue_leaves_profiles_untouched() {
        let (entered_tx, entered_rx) = std_mpsc::channel();
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        let transport = Arc::new(GatedTransport {
            entered: Mutex::new(entered_tx),
            gate: Mutex::new(gate_rx),
            sent: Mutex::new(Vec::new()),
        });
        let (handle, worker) = spawn_dispatcher(transport.clone(), 2).expect("spawn");
        let controller = DeviceConfigController::new(DeviceState::new(default_profiles()), handle, true);

        controller.enter_host_mode().expect("queued");
        entered_rx.recv().expect("worker holds host mode packet");
        controller.query_firmware().expect("queued");

        /* One slot left; a single field needs two */
        assert!(matches!(
            controller.apply(Some(500), None, None),
            Err(ConfigError::Dispatch(DispatchError::QueueFull(2)))
        ));
        assert!(matches!(
            controller.apply(Some(500), Some(3200), None),
            Err(ConfigError::Dispatch(DispatchError::QueueFull(2)))
        ));
        assert!(matches!(
            controller.switch_profile(),
            Err(ConfigError::Dispatch(DispatchError::QueueFull(2)))
        ));

        let current = controller.state().current();
        assert_eq!(current.index, 0);
        assert_eq!((current.report_rate_hz, current.dpi), (125, 800));

        drop(gate_tx);
        worker.shutdown();
        assert_eq!(
            *transport.sent.lock(),
            [
                (FEATURE_ONBOARD_PROFILES, 0x01),
                (g502::FEATURE_DEVICE_FW, g502::FW_FN_GET_INFO)
            ]
        );
    }
}

/* Inbound report routing and response correlation.
 *
 * The device answers SET_REPORT with an empty handshake; the actual data
 * arrives later as an interrupt-delivered long report, independent of the
 * request that caused it. Responses are therefore matched purely by
 * (feature index, function) and applied to whatever profile is current
 * when they land. There is no request id: two outstanding requests for the
 * same feature/function are indistinguishable, and the later reply simply
 * overwrites the earlier one. */

use tracing::{debug, warn};

use crate::device::{DeviceState, Profile};
use crate::driver::g502::{
    DPI_FN_GET, FEATURE_DEVICE_FW, FEATURE_DPI, FEATURE_REPORT_RATE, MAX_DPI, RATE_FN_GET,
    REGULAR_REPORT_SIZE, RateTable,
};
use crate::driver::hidpp::{ReportKind, Response};

/* Where an inbound buffer ended up. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEvent {
    /* Ordinary mouse report, belongs to the regular input handler. */
    Regular,
    /* Not a HID++ long frame (unrelated report or empty acknowledgement). */
    NotProtocol,
    Protocol(Correlation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    ReportRate(u16),
    Dpi(u16),
    FirmwareInfo {
        entity_type: u8,
        major: u8,
        minor: u8,
        build: u16,
    },
    DeviceError {
        feature: u8,
        function: u8,
        code: u8,
    },
    /* Well formed, but nothing we track or a value we refuse to cache. */
    Ignored,
    /* State lock was contended; the cached value stays stale until the next read-back. */
    Dropped,
}

pub struct ResponseCorrelator {
    state: DeviceState,
    supports_protocol: bool,
}

impl ResponseCorrelator {
    pub fn new(state: DeviceState, supports_protocol: bool) -> Self {
        Self {
            state,
            supports_protocol,
        }
    }

    /* Classify one inbound buffer and apply it if it is a tracked response. */
    /* Runs on the delivery path, so it never waits for the state lock. */
    pub fn process(&self, buf: &[u8]) -> RawEvent {
        if buf.len() == REGULAR_REPORT_SIZE {
            return RawEvent::Regular;
        }
        if !self.supports_protocol {
            return RawEvent::NotProtocol;
        }

        match Response::parse(buf) {
            Some(response) if response.kind() == ReportKind::Long => {
                RawEvent::Protocol(self.correlate(&response))
            }
            _ => RawEvent::NotProtocol,
        }
    }

    fn correlate(&self, response: &Response<'_>) -> Correlation {
        if let Some((feature, function, code)) = response.error() {
            warn!("Device rejected feature 0x{feature:02x} fn {function} (error 0x{code:02x})");
            return Correlation::DeviceError {
                feature,
                function,
                code,
            };
        }

        let params = response.params();
        match (response.feature_index(), response.function()) {
            (FEATURE_REPORT_RATE, RATE_FN_GET) => {
                let hz = RateTable::to_host(params[0]);
                if hz == 0 {
                    warn!("Device reported unknown report rate byte 0x{:02x}", params[0]);
                    return Correlation::Ignored;
                }
                self.update_current(|p| p.report_rate_hz = hz, Correlation::ReportRate(hz))
            }
            (FEATURE_DPI, DPI_FN_GET) => {
                let dpi = u16::from_be_bytes([params[1], params[2]]);
                if dpi == 0 || dpi > MAX_DPI {
                    warn!("Device reported out-of-range DPI {dpi}");
                    return Correlation::Ignored;
                }
                self.update_current(|p| p.dpi = dpi, Correlation::Dpi(dpi))
            }
            (FEATURE_DEVICE_FW, _) => {
                let info = Correlation::FirmwareInfo {
                    entity_type: params[0] & 0x0F,
                    major: params[4],
                    minor: params[5],
                    build: u16::from_be_bytes([params[6], params[7]]),
                };
                debug!(
                    "Firmware info: {} {info:?}",
                    String::from_utf8_lossy(&params[1..4])
                );
                info
            }
            (feature, function) => {
                debug!("Ignoring response for feature 0x{feature:02x} fn {function}");
                Correlation::Ignored
            }
        }
    }

    fn update_current(
        &self,
        apply: impl FnOnce(&mut Profile),
        outcome: Correlation,
    ) -> Correlation {
        let Some(mut store) = self.state.try_lock() else {
            debug!("Device state busy, dropping {outcome:?}");
            return Correlation::Dropped;
        };

        let profile = store.current_mut();
        apply(profile);
        debug!("Profile {} updated from device: {outcome:?}", profile.index);
        outcome
    }
}

use std::sync::Arc;

use zbus::interface;
use zbus::object_server::SignalEmitter;

use crate::attributes::{self, AttributeError};
use crate::controller::{ConfigError, DeviceConfigController};

/* Map library errors onto the DBus error names clients expect. */
fn to_dbus_error(err: AttributeError) -> zbus::fdo::Error {
    match err {
        AttributeError::Unknown(_) | AttributeError::Parse(_) | AttributeError::Rejected { .. } => {
            zbus::fdo::Error::InvalidArgs(err.to_string())
        }
        AttributeError::Config(err) => config_error(err),
    }
}

fn config_error(err: ConfigError) -> zbus::fdo::Error {
    match err {
        ConfigError::UnsupportedReportRate(_) | ConfigError::DpiOutOfRange(_) => {
            zbus::fdo::Error::InvalidArgs(err.to_string())
        }
        ConfigError::ProtocolUnsupported => zbus::fdo::Error::NotSupported(err.to_string()),
        ConfigError::Codec(_) | ConfigError::Dispatch(_) => zbus::fdo::Error::Failed(err.to_string()),
    }
}

/* The org.g502d1.Device interface. */
/*  */
/* One object per protocol interface. Every read reflects the current */
/* profile of the in-memory model, which tracks intended values until the */
/* device's read-back replies arrive. */
pub struct G502Device {
    name: String,
    controller: Arc<DeviceConfigController>,
}

impl G502Device {
    pub fn new(name: String, controller: Arc<DeviceConfigController>) -> Self {
        Self { name, controller }
    }

    /* Announce everything a change to the current profile can alter. */
    async fn emit_profile_changes(&self, emitter: &SignalEmitter<'_>, selection_moved: bool) {
        if selection_moved {
            let _ = self.active_profile_changed(emitter).await;
        }
        let _ = self.report_rate_changed(emitter).await;
        let _ = self.dpi_changed(emitter).await;
        let _ = self.profiles_changed(emitter).await;
    }
}

#[interface(name = "org.g502d1.Device")]
impl G502Device {
    /* Device name from the HID layer (constant). */
    #[zbus(property)]
    async fn name(&self) -> String {
        self.name.clone()
    }

    #[zbus(property)]
    async fn report_rate(&self) -> u32 {
        u32::from(self.controller.state().current().report_rate_hz)
    }

    #[zbus(property)]
    async fn dpi(&self) -> u32 {
        u32::from(self.controller.state().current().dpi)
    }

    #[zbus(property)]
    async fn active_profile(&self) -> u32 {
        self.controller.state().current().index as u32
    }

    /* All profiles as `(index, report rate, dpi, rgb)`. */
    #[zbus(property)]
    async fn profiles(&self) -> Vec<(u32, u32, u32, u32)> {
        self.controller
            .state()
            .snapshot()
            .iter()
            .map(|p| {
                (
                    p.index as u32,
                    u32::from(p.report_rate_hz),
                    u32::from(p.dpi),
                    p.rgb.to_u32(),
                )
            })
            .collect()
    }

    #[zbus(property)]
    async fn packets_sent(&self) -> u64 {
        self.controller.stats().sent()
    }

    #[zbus(property)]
    async fn packets_failed(&self) -> u64 {
        self.controller.stats().failed()
    }

    /* Read a control-surface attribute (`report_rate` or `dpi`). */
    async fn read_attribute(&self, name: &str) -> zbus::fdo::Result<String> {
        attributes::show(&self.controller, name).map_err(to_dbus_error)
    }

    /* Write a control-surface attribute. Returns the bytes consumed. */
    async fn write_attribute(
        &self,
        name: &str,
        value: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<u32> {
        let consumed = attributes::store(&self.controller, name, value).map_err(to_dbus_error)?;
        self.emit_profile_changes(&emitter, false).await;

        Ok(u32::try_from(consumed).unwrap_or(u32::MAX))
    }

    /* Cycle to the next profile. Returns the new profile index. */
    async fn switch_profile(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<u32> {
        let profile = self.controller.switch_profile().map_err(config_error)?;
        self.emit_profile_changes(&emitter, true).await;

        Ok(profile.index as u32)
    }

    /* Request the firmware version; the reply is written to the daemon log. */
    async fn query_firmware(&self) -> zbus::fdo::Result<()> {
        self.controller.query_firmware().map_err(config_error)
    }
}

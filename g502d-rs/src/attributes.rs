/* Read/write control-surface attributes.
 *
 * Each attribute is one row of a table; a single pair of generic handlers
 * does the parsing, validation and dispatch for all of them. Reads and
 * writes behave like sysfs attribute files: reads end in a newline and a
 * successful write reports the number of bytes it consumed. */

use thiserror::Error;

use crate::controller::{ConfigError, DeviceConfigController};
use crate::device::Profile;
use crate::driver::g502::{MAX_DPI, RateTable};

#[derive(Debug, Error)]
pub enum AttributeError {
    #[error("No such attribute '{0}'")]
    Unknown(String),

    #[error("Invalid number '{0}'")]
    Parse(String),

    #[error("{value} is not a valid {name}")]
    Rejected { name: &'static str, value: u32 },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct Attribute {
    pub name: &'static str,
    getter: fn(&Profile) -> u32,
    validator: fn(u32) -> Option<u16>,
    encoder: fn(&DeviceConfigController, u16) -> Result<(), ConfigError>,
}

fn get_report_rate(profile: &Profile) -> u32 {
    u32::from(profile.report_rate_hz)
}

fn validate_report_rate(value: u32) -> Option<u16> {
    let hz = u16::try_from(value).ok()?;
    RateTable::supported().any(|rate| rate == hz).then_some(hz)
}

fn apply_report_rate(controller: &DeviceConfigController, hz: u16) -> Result<(), ConfigError> {
    controller.apply(Some(hz), None, None)
}

fn get_dpi(profile: &Profile) -> u32 {
    u32::from(profile.dpi)
}

fn validate_dpi(value: u32) -> Option<u16> {
    let dpi = u16::try_from(value).ok()?;
    (1..=MAX_DPI).contains(&dpi).then_some(dpi)
}

fn apply_dpi(controller: &DeviceConfigController, dpi: u16) -> Result<(), ConfigError> {
    controller.apply(None, Some(dpi), None)
}

pub static ATTRIBUTES: [Attribute; 2] = [
    Attribute {
        name: "report_rate",
        getter: get_report_rate,
        validator: validate_report_rate,
        encoder: apply_report_rate,
    },
    Attribute {
        name: "dpi",
        getter: get_dpi,
        validator: validate_dpi,
        encoder: apply_dpi,
    },
];

fn lookup(name: &str) -> Result<&'static Attribute, AttributeError> {
    ATTRIBUTES
        .iter()
        .find(|attr| attr.name == name)
        .ok_or_else(|| AttributeError::Unknown(name.to_string()))
}

/* Read an attribute of the current profile, newline terminated. */
pub fn show(controller: &DeviceConfigController, name: &str) -> Result<String, AttributeError> {
    if !controller.supports_protocol() {
        return Err(ConfigError::ProtocolUnsupported.into());
    }
    let attr = lookup(name)?;
    let value = (attr.getter)(controller.state().lock().current());
    Ok(format!("{value}\n"))
}

/* Parse, validate and apply a write. Returns the bytes consumed. */
pub fn store(
    controller: &DeviceConfigController,
    name: &str,
    input: &str,
) -> Result<usize, AttributeError> {
    let attr = lookup(name)?;
    let value = parse_uint(input)?;
    let value = (attr.validator)(value).ok_or(AttributeError::Rejected {
        name: attr.name,
        value,
    })?;
    (attr.encoder)(controller, value)?;
    Ok(input.len())
}

/* Parse an unsigned integer the way kstrtouint(.., 0, ..) does: one optional
 * trailing newline, optional leading '+', "0x" for hex, a leading '0' for
 * octal, decimal otherwise. */
pub fn parse_uint(input: &str) -> Result<u32, AttributeError> {
    let parse_err = || AttributeError::Parse(input.trim_end().to_string());

    let s = input.strip_suffix('\n').unwrap_or(input);
    let s = s.strip_prefix('+').unwrap_or(s);

    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(parse_err());
    }
    u32::from_str_radix(digits, radix).map_err(|_| parse_err())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::{DeviceState, default_profiles};
    use crate::dispatch::{DispatchWorker, spawn_dispatcher};
    use crate::driver::{Transport, TransportError};

    struct NullTransport;

    impl Transport for NullTransport {
        fn name(&self) -> &str {
            "null"
        }

        fn send_blocking(&self, _report_id: u8, _report: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn controller(supports_protocol: bool) -> (DeviceConfigController, DispatchWorker) {
        let (handle, worker) = spawn_dispatcher(Arc::new(NullTransport), 16).expect("spawn");
        let state = DeviceState::new(default_profiles());
        (
            DeviceConfigController::new(state, handle, supports_protocol),
            worker,
        )
    }

    #[test]
    fn parse_accepts_kernel_number_formats() {
        assert_eq!(parse_uint("1000").unwrap(), 1000);
        assert_eq!(parse_uint("1000\n").unwrap(), 1000);
        assert_eq!(parse_uint("+250").unwrap(), 250);
        assert_eq!(parse_uint("0x3e8").unwrap(), 1000);
        assert_eq!(parse_uint("0X3E8").unwrap(), 1000);
        assert_eq!(parse_uint("0764").unwrap(), 500);
        assert_eq!(parse_uint("0").unwrap(), 0);
    }

    #[test]
    fn parse_rejects_garbage() {
        for input in ["", "\n", "abc", "12 ", " 12", "1000\n\n", "-5", "0x", "089", "0x+5", "99999999999"] {
            assert!(parse_uint(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn show_reports_current_profile() {
        let (controller, worker) = controller(true);
        assert_eq!(show(&controller, "report_rate").unwrap(), "125\n");
        assert_eq!(show(&controller, "dpi").unwrap(), "800\n");
        worker.shutdown();
    }

    #[test]
    fn store_returns_bytes_consumed() {
        let (controller, worker) = controller(true);
        assert_eq!(store(&controller, "report_rate", "1000\n").unwrap(), 5);
        assert_eq!(store(&controller, "dpi", "0x640").unwrap(), 5);
        worker.shutdown();

        assert_eq!(show(&controller, "report_rate").unwrap(), "1000\n");
        assert_eq!(show(&controller, "dpi").unwrap(), "1600\n");
    }

    #[test]
    fn store_rejects_out_of_range_values() {
        let (controller, worker) = controller(true);
        assert!(matches!(
            store(&controller, "report_rate", "300"),
            Err(AttributeError::Rejected { name: "report_rate", value: 300 })
        ));
        assert!(matches!(
            store(&controller, "dpi", "0"),
            Err(AttributeError::Rejected { name: "dpi", value: 0 })
        ));
        assert!(matches!(
            store(&controller, "dpi", "25601"),
            Err(AttributeError::Rejected { .. })
        ));
        assert!(matches!(
            store(&controller, "dpi", "70000"),
            Err(AttributeError::Rejected { .. })
        ));
        assert!(matches!(
            store(&controller, "colour", "1"),
            Err(AttributeError::Unknown(_))
        ));
        worker.shutdown();
        assert_eq!(controller.stats().sent(), 0);
    }

    #[test]
    fn mouse_interface_has_no_control_surface() {
        let (controller, worker) = controller(false);
        assert!(matches!(
            show(&controller, "dpi"),
            Err(AttributeError::Config(ConfigError::ProtocolUnsupported))
        ));
        assert!(matches!(
            store(&controller, "dpi", "1600"),
            Err(AttributeError::Config(ConfigError::ProtocolUnsupported))
        ));
        worker.shutdown();
    }
}

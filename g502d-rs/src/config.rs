use std::path::Path;

use configparser::ini::Ini;
use tracing::{debug, warn};

use crate::device::{Profile, Rgb, default_profiles};
use crate::dispatch::{DEFAULT_QUEUE_DEPTH, MIN_QUEUE_DEPTH};
use crate::driver::g502::{MAX_DPI, MAX_PROFILES, RateTable};
use crate::input::{DEFAULT_SWITCH_BUTTON, SwitchButton};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/g502d/g502d.conf";

/* Largest dispatch queue the daemon accepts from the config file. */
const MAX_QUEUE_DEPTH: usize = 1024;

/* Daemon settings. Everything has a default; the file only overrides. */
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub queue_depth: usize,
    pub switch_button: u8,
    pub profiles: [Profile; MAX_PROFILES],
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            switch_button: DEFAULT_SWITCH_BUTTON,
            profiles: default_profiles(),
        }
    }
}

/* Load the INI file at `path`.
 *
 * A missing file yields the defaults. Keys with invalid values are warned
 * about and skipped, leaving the default for that key in place:
 *
 * ```ini
 * [daemon]
 * queuedepth = 16
 * switchbutton = 9
 *
 * [profile0]
 * reportrate = 1000
 * dpi = 1600
 * rgb = ff0000
 * ``` */
pub fn load_config(path: &Path) -> DaemonConfig {
    if !path.exists() {
        debug!("No config file at {}, using defaults", path.display());
        return DaemonConfig::default();
    }

    let mut ini = Ini::new();
    match ini.load(path) {
        Ok(_) => parse_config(&ini),
        Err(e) => {
            warn!("Failed to parse {}: {e}", path.display());
            DaemonConfig::default()
        }
    }
}

/* Same as `load_config`, for configuration held in memory. */
pub fn parse_config_str(contents: &str) -> Result<DaemonConfig, String> {
    let mut ini = Ini::new();
    ini.read(contents.to_string())?;
    Ok(parse_config(&ini))
}

fn parse_config(ini: &Ini) -> DaemonConfig {
    let mut config = DaemonConfig::default();

    if let Some(depth) = parse_key(ini, "daemon", "queuedepth", |v| {
        v.parse::<usize>()
            .ok()
            .filter(|d| (MIN_QUEUE_DEPTH..=MAX_QUEUE_DEPTH).contains(d))
    }) {
        config.queue_depth = depth;
    }

    if let Some(button) = parse_key(ini, "daemon", "switchbutton", |v| {
        v.parse::<u8>().ok().filter(|&b| SwitchButton::new(b).is_some())
    }) {
        config.switch_button = button;
    }

    for (i, profile) in config.profiles.iter_mut().enumerate() {
        let section = format!("profile{i}");

        if let Some(hz) = parse_key(ini, &section, "reportrate", |v| {
            v.parse::<u16>().ok().filter(|&hz| RateTable::to_device(hz) != 0)
        }) {
            profile.report_rate_hz = hz;
        }
        if let Some(dpi) = parse_key(ini, &section, "dpi", |v| {
            v.parse::<u16>().ok().filter(|d| (1..=MAX_DPI).contains(d))
        }) {
            profile.dpi = dpi;
        }
        if let Some(rgb) = parse_key(ini, &section, "rgb", parse_rgb) {
            profile.rgb = rgb;
        }
    }

    config
}

/* Look up `section.key` and run `parse` on it, warning when the value is unusable. */
fn parse_key<T>(ini: &Ini, section: &str, key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = ini.get(section, key)?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        warn!("Ignoring invalid [{section}] {key} = '{raw}'");
    }
    parsed
}

/* `RRGGBB`, with or without a leading '#' or "0x". */
fn parse_rgb(s: &str) -> Option<Rgb> {
    let hex = s
        .strip_prefix('#')
        .or_else(|| s.strip_prefix("0x"))
        .unwrap_or(s);
    if hex.len() != 6 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok().map(Rgb::from_u32)
}

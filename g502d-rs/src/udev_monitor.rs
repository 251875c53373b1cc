/* hidraw discovery: initial enumeration followed by hotplug monitoring.
 *
 * libudev handles are not `Send`, so everything udev related lives on one
 * dedicated thread that forwards plain `DeviceAction` values to the async
 * side through a tokio channel. */

use std::os::fd::AsFd;
use std::path::PathBuf;
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::driver::g502::{G502_HERO_PRODUCT_ID, LOGITECH_VENDOR_ID};

const BUS_USB: u16 = 0x03;

/* How long one poll waits before checking whether the receiver is gone */
const MONITOR_POLL_TIMEOUT_MS: u16 = 500;

/* A hidraw node belonging to a supported mouse. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidrawDevice {
    pub sysname: String,
    pub devnode: PathBuf,
    pub name: String,
    pub vid: u16,
    pub pid: u16,
    /* USB interface number, when it could be resolved from sysfs */
    pub interface: Option<u8>,
    /* Syspath of the owning USB device, shared by both interfaces */
    pub physical: String,
}

#[derive(Debug, Clone)]
pub enum DeviceAction {
    Add(HidrawDevice),
    Remove { sysname: String },
}

/* Parse a `HID_ID` property like `0003:0000046D:0000C08B`. */
pub fn parse_hid_id(id: &str) -> Option<(u16, u16, u16)> {
    let mut parts = id.split(':');
    let bus = u16::from_str_radix(parts.next()?, 16).ok()?;
    let vid = u32::from_str_radix(parts.next()?, 16).ok()?;
    let pid = u32::from_str_radix(parts.next()?, 16).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((bus, u16::try_from(vid).ok()?, u16::try_from(pid).ok()?))
}

/* Interface number from a USB interface sysname like `1-2:1.1`. */
pub fn parse_interface_number(sysname: &str) -> Option<u8> {
    let (_, config) = sysname.rsplit_once(':')?;
    let (_, interface) = config.rsplit_once('.')?;
    interface.parse().ok()
}

pub fn is_supported(bus: u16, vid: u16, pid: u16) -> bool {
    bus == BUS_USB && vid == LOGITECH_VENDOR_ID && pid == G502_HERO_PRODUCT_ID
}

/* Build a `HidrawDevice` for `device`, or `None` if it is not ours. */
fn probe(device: &udev::Device) -> Option<HidrawDevice> {
    let sysname = device.sysname().to_string_lossy().into_owned();
    let hid = device.parent_with_subsystem("hid").ok().flatten()?;

    let hid_id = hid.property_value("HID_ID")?.to_string_lossy().into_owned();
    let Some((bus, vid, pid)) = parse_hid_id(&hid_id) else {
        debug!("{sysname}: unparseable HID_ID '{hid_id}'");
        return None;
    };
    if !is_supported(bus, vid, pid) {
        return None;
    }

    let devnode = device.devnode()?.to_path_buf();
    let name = hid
        .property_value("HID_NAME")
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Logitech G502 HERO".to_string());

    let usb_interface = device
        .parent_with_subsystem_devtype("usb", "usb_interface")
        .ok()
        .flatten();
    let interface = usb_interface.as_ref().and_then(|intf| {
        intf.attribute_value("bInterfaceNumber")
            .and_then(|v| u8::from_str_radix(v.to_str()?.trim(), 16).ok())
            .or_else(|| parse_interface_number(&intf.sysname().to_string_lossy()))
    });

    let physical = device
        .parent_with_subsystem_devtype("usb", "usb_device")
        .ok()
        .flatten()
        .map(|usb| usb.syspath().to_string_lossy().into_owned())
        .unwrap_or_else(|| hid.syspath().to_string_lossy().into_owned());

    Some(HidrawDevice {
        sysname,
        devnode,
        name,
        vid,
        pid,
        interface,
        physical,
    })
}

/* Start the discovery thread. Existing devices are reported first, then */
/* hotplug events until `tx` is closed. */
pub fn spawn_monitor(tx: mpsc::Sender<DeviceAction>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("udev-monitor".into())
        .spawn(move || {
            if let Err(e) = run_monitor(&tx) {
                warn!("udev monitor stopped: {e}");
            }
        })
}

fn run_monitor(tx: &mpsc::Sender<DeviceAction>) -> std::io::Result<()> {
    /* Start listening before enumerating so nothing plugged in between is missed */
    let socket = udev::MonitorBuilder::new()?
        .match_subsystem("hidraw")?
        .listen()?;

    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("hidraw")?;
    for device in enumerator.scan_devices()? {
        if let Some(found) = probe(&device) {
            info!("Found {} at {}", found.name, found.devnode.display());
            if tx.blocking_send(DeviceAction::Add(found)).is_err() {
                return Ok(());
            }
        }
    }

    while !tx.is_closed() {
        let ready = {
            let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, MONITOR_POLL_TIMEOUT_MS)
        };
        match ready {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        for event in socket.iter() {
            let action = match event.event_type() {
                udev::EventType::Add => match probe(&event.device()) {
                    Some(found) => DeviceAction::Add(found),
                    None => continue,
                },
                udev::EventType::Remove => DeviceAction::Remove {
                    sysname: event.sysname().to_string_lossy().into_owned(),
                },
                _ => continue,
            };

            debug!("udev: {action:?}");
            if tx.blocking_send(action).is_err() {
                return Ok(());
            }
        }
    }

    Ok(())
}

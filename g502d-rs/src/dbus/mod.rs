pub mod device;
pub mod manager;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zbus::connection::Builder;

use crate::config::DaemonConfig;
use crate::driver::g502::{self, PROTOCOL_INTERFACE};
use crate::driver::{HidrawIo, ReportReader};
use crate::input::SwitchButton;
use crate::session::DeviceSession;
use crate::udev_monitor::{DeviceAction, HidrawDevice};

pub const BUS_NAME: &str = "org.g502d1";
pub const MANAGER_PATH: &str = "/org/g502d1";

/* Object path of the device object exported for `sysname`. */
pub fn device_path(sysname: &str) -> String {
    let escaped: String = sysname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{MANAGER_PATH}/device/{escaped}")
}

/* One attached hidraw interface. */
struct Attached {
    session: DeviceSession,
    reader: Option<ReportReader>,
    physical: String,
    /* Set for protocol interfaces, which are exported on the bus */
    object_path: Option<String>,
}

impl Attached {
    /* Stop the reader and drain the dispatcher. Blocks. */
    fn teardown(self) {
        if let Some(reader) = self.reader {
            reader.stop();
        }
        self.session.detach();
    }
}

/* Log how many buttons the mouse interface advertises, after the usage fixup. */
fn inspect_report_descriptor(io: &HidrawIo) {
    let mut rdesc = match io.report_descriptor() {
        Ok(rdesc) => rdesc,
        Err(e) => {
            debug!("Cannot read report descriptor: {e}");
            return;
        }
    };

    if g502::fixup_report_descriptor(&mut rdesc) {
        info!(
            "{}: report descriptor advertises 16 buttons, device has {}",
            io.path().display(),
            g502::PATCHED_USAGE_MAXIMUM
        );
    } else if let Some(buttons) = g502::usage_maximum(&rdesc) {
        debug!("{}: {buttons} buttons advertised", io.path().display());
    }
}

/* Open the hidraw node and bring up a session plus its reader thread. */
fn attach(
    dev: &HidrawDevice,
    config: &DaemonConfig,
    switch_tx: &mpsc::Sender<String>,
) -> Result<Attached> {
    let supports_protocol = dev.interface == Some(PROTOCOL_INTERFACE);
    let io = Arc::new(
        HidrawIo::open(&dev.devnode)
            .with_context(|| format!("Failed to open {}", dev.devnode.display()))?,
    );

    if !supports_protocol {
        inspect_report_descriptor(&io);
    }

    let session = DeviceSession::attach(&dev.sysname, io.clone(), supports_protocol, config)
        .with_context(|| format!("Failed to attach {}", dev.sysname))?;

    /* Only the mouse interface reports the switch button */
    let switch = if supports_protocol {
        None
    } else {
        SwitchButton::new(config.switch_button)
    };
    let physical = dev.physical.clone();
    let tx = switch_tx.clone();
    let mut router = session.router(switch, move || {
        if tx.try_send(physical.clone()).is_err() {
            warn!("Profile switch dropped, event queue full");
        }
    });

    let reader = io
        .spawn_reader(move |buf| {
            router.deliver(buf);
        })
        .with_context(|| format!("Failed to start reader for {}", dev.sysname))?;

    Ok(Attached {
        session,
        reader: Some(reader),
        physical: dev.physical.clone(),
        object_path: supports_protocol.then(|| device_path(&dev.sysname)),
    })
}

/* The press arrives on the mouse interface; the profiles live on the */
/* protocol interface of the same physical device. */
fn switch_target<'a>(attached: &'a HashMap<String, Attached>, physical: &str) -> Option<&'a Attached> {
    attached
        .values()
        .find(|a| a.physical == physical && a.session.supports_protocol())
}

/* Starts the DBus server and registers the Manager. */
/*  */
/* This function runs until the udev channel closes or the daemon receives */
/* Ctrl-C. Device hotplug events arrive from the udev monitor through */
/* `device_rx`; switch-button presses arrive from the reader threads. */
pub async fn run_server(
    mut device_rx: mpsc::Receiver<DeviceAction>,
    config: DaemonConfig,
) -> Result<()> {
    let manager = manager::G502Manager::new(config.clone());

    let conn = Builder::system()?
        .name(BUS_NAME)?
        .serve_at(MANAGER_PATH, manager)?
        .build()
        .await
        .context("Failed to connect to the system bus")?;

    info!("DBus server ready on {BUS_NAME}");

    let (switch_tx, mut switch_rx) = mpsc::channel::<String>(8);
    let mut attached: HashMap<String, Attached> = HashMap::new();

    loop {
        tokio::select! {
            action = device_rx.recv() => {
                let Some(action) = action else {
                    info!("udev monitor channel closed, shutting down");
                    break;
                };
                match action {
                    DeviceAction::Add(dev) => {
                        if attached.contains_key(&dev.sysname) {
                            continue;
                        }
                        let entry = match attach(&dev, &config, &switch_tx) {
                            Ok(entry) => entry,
                            Err(e) => {
                                warn!("{e:#}");
                                continue;
                            }
                        };

                        if let Some(path) = &entry.object_path {
                            let object = device::G502Device::new(
                                dev.name.clone(),
                                Arc::clone(entry.session.controller()),
                            );
                            if let Err(e) = conn.object_server().at(path.as_str(), object).await {
                                warn!("Failed to register device {}: {e}", dev.sysname);
                            }

                            let iface_ref = conn
                                .object_server()
                                .interface::<_, manager::G502Manager>(MANAGER_PATH)
                                .await?;
                            iface_ref.get_mut().await.add_device(path.clone()).await;
                            iface_ref
                                .get()
                                .await
                                .devices_changed(iface_ref.signal_emitter())
                                .await?;

                            info!("Device {} registered at {path}", dev.name);
                        }

                        attached.insert(dev.sysname.clone(), entry);
                    }
                    DeviceAction::Remove { sysname } => {
                        let Some(entry) = attached.remove(&sysname) else {
                            debug!("Device removed: {sysname} (was not attached)");
                            continue;
                        };

                        if let Some(path) = &entry.object_path {
                            let _ = conn
                                .object_server()
                                .remove::<device::G502Device, _>(path.as_str())
                                .await;

                            let iface_ref = conn
                                .object_server()
                                .interface::<_, manager::G502Manager>(MANAGER_PATH)
                                .await?;
                            iface_ref.get_mut().await.remove_device(path).await;
                            iface_ref
                                .get()
                                .await
                                .devices_changed(iface_ref.signal_emitter())
                                .await?;
                        }

                        if tokio::task::spawn_blocking(move || entry.teardown()).await.is_err() {
                            warn!("Teardown of {sysname} panicked");
                        }
                        info!("Device {sysname} removed");
                    }
                }
            }
            Some(physical) = switch_rx.recv() => {
                match switch_target(&attached, &physical) {
                    Some(a) => {
                        if let Err(e) = a.session.controller().switch_profile() {
                            warn!("Profile switch on {} failed: {e}", a.session.name());
                        }
                    }
                    None => debug!("Switch pressed on {physical} without a protocol interface"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    let entries: Vec<Attached> = attached.into_values().collect();
    tokio::task::spawn_blocking(move || entries.into_iter().for_each(Attached::teardown))
        .await
        .context("Device teardown panicked")?;

    Ok(())
}

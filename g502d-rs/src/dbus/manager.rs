use std::sync::Arc;

use tokio::sync::RwLock;
use zbus::interface;
use zbus::object_server::{ObjectServer, SignalEmitter};
use zbus::zvariant::{ObjectPath, OwnedObjectPath};

use crate::config::DaemonConfig;
#[cfg(feature = "dev-hooks")]
use crate::session::DeviceSession;

/* DBus API version. Bumped on incompatible changes to the Device interface. */
pub const API_VERSION: i32 = 1;

/* The org.g502d1.Manager interface. */
/*  */
/* Entry point for clients (g502ctl) to discover attached devices. */
pub struct G502Manager {
    devices: Arc<RwLock<Vec<String>>>,
    #[cfg_attr(not(feature = "dev-hooks"), allow(dead_code))]
    config: DaemonConfig,
    #[cfg(feature = "dev-hooks")]
    test_devices: Vec<(String, DeviceSession)>,
    #[cfg(feature = "dev-hooks")]
    next_test_id: u32,
}

impl G502Manager {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            devices: Arc::new(RwLock::new(Vec::new())),
            config,
            #[cfg(feature = "dev-hooks")]
            test_devices: Vec::new(),
            #[cfg(feature = "dev-hooks")]
            next_test_id: 0,
        }
    }

    /* Register a new device path (called when a protocol interface attaches). */
    pub async fn add_device(&self, path: String) {
        self.devices.write().await.push(path);
    }

    /* Remove a device path (called on detach). */
    pub async fn remove_device(&self, path: &str) {
        self.devices.write().await.retain(|p| p != path);
    }
}

#[cfg(feature = "dev-hooks")]
impl G502Manager {
    /* Attach a simulated device described by `json` and export it. */
    async fn attach_test_device(
        &mut self,
        json: &str,
        server: &ObjectServer,
    ) -> zbus::fdo::Result<String> {
        use crate::dbus::{device::G502Device, device_path};
        use crate::test_device::spec;

        let spec = spec::parse_json(json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("Invalid device JSON: {e}")))?;

        let sysname = format!("test{}", self.next_test_id);
        self.next_test_id += 1;

        let device = Arc::new(spec::build_device(&sysname, &spec));
        let session = DeviceSession::attach(&sysname, device.clone(), true, &self.config)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let mut router = session.router(None, || {});
        device.connect_inbound(move |buf| {
            router.deliver(buf);
        });

        let path = device_path(&sysname);
        let object = G502Device::new(spec.name.clone(), Arc::clone(session.controller()));
        server
            .at(path.as_str(), object)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        self.add_device(path.clone()).await;
        self.test_devices.push((path.clone(), session));
        tracing::info!("Test device {sysname} loaded at {path}");
        Ok(path)
    }

    async fn detach_test_devices(&mut self, server: &ObjectServer) {
        use crate::dbus::device::G502Device;

        for (path, session) in std::mem::take(&mut self.test_devices) {
            let _ = server.remove::<G502Device, _>(path.as_str()).await;
            self.remove_device(&path).await;
            if tokio::task::spawn_blocking(move || session.detach())
                .await
                .is_err()
            {
                tracing::warn!("Detaching test device {path} panicked");
            }
        }
    }
}

#[interface(name = "org.g502d1.Manager")]
impl G502Manager {
    /* The DBus API version (constant, read-only). */
    #[zbus(property)]
    async fn api_version(&self) -> i32 {
        API_VERSION
    }

    /* Array of object paths to the attached devices. */
    #[zbus(property)]
    async fn devices(&self) -> Vec<ObjectPath<'static>> {
        self.devices
            .read()
            .await
            .iter()
            .filter_map(|p| ObjectPath::try_from(p.as_str()).ok())
            .map(|p| p.to_owned())
            .collect()
    }

    /* Attach a simulated device from a JSON description (dev-hooks builds only). */
    async fn load_test_device(
        &mut self,
        json: &str,
        #[zbus(object_server)] server: &ObjectServer,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<OwnedObjectPath> {
        #[cfg(feature = "dev-hooks")]
        {
            let path = self.attach_test_device(json, server).await?;
            let _ = self.devices_changed(&emitter).await;
            OwnedObjectPath::try_from(path).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
        }
        #[cfg(not(feature = "dev-hooks"))]
        {
            let _ = (json, server, emitter);
            Err(zbus::fdo::Error::NotSupported(
                "Daemon built without dev-hooks".to_string(),
            ))
        }
    }

    /* Detach every simulated device (dev-hooks builds only). */
    async fn reset_test_device(
        &mut self,
        #[zbus(object_server)] server: &ObjectServer,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<()> {
        #[cfg(feature = "dev-hooks")]
        {
            self.detach_test_devices(server).await;
            let _ = self.devices_changed(&emitter).await;
            Ok(())
        }
        #[cfg(not(feature = "dev-hooks"))]
        {
            let _ = (server, emitter);
            Err(zbus::fdo::Error::NotSupported(
                "Daemon built without dev-hooks".to_string(),
            ))
        }
    }
}

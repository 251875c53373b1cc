/* g502ctl DBus client: thin wrapper over the org.g502d1 API for the
 * manager and device objects exported by g502d. */

use anyhow::{Context, Result, anyhow};
use zbus::Connection;
use zbus::zvariant::{OwnedValue, Value};

const BUS_NAME: &str = "org.g502d1";
const MANAGER_PATH: &str = "/org/g502d1";
const MANAGER_IFACE: &str = "org.g502d1.Manager";
const DEVICE_IFACE: &str = "org.g502d1.Device";

/// One entry of the device's `Profiles` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileInfo {
    pub index: u32,
    pub report_rate: u32,
    pub dpi: u32,
    pub rgb: u32,
}

/// A client that talks to the `g502d` daemon over the system DBus.
pub struct G502Client {
    conn: Connection,
}

impl G502Client {
    pub async fn connect() -> Result<Self> {
        let conn = Connection::system()
            .await
            .context("Cannot connect to the system DBus")?;
        Ok(Self { conn })
    }

    pub async fn get_api_version(&self) -> Result<i32> {
        let val = self.get_property(MANAGER_PATH, MANAGER_IFACE, "ApiVersion").await?;
        i32::try_from(val).context("Type mismatch for ApiVersion")
    }

    pub async fn list_devices(&self) -> Result<Vec<String>> {
        let val = self.get_property(MANAGER_PATH, MANAGER_IFACE, "Devices").await?;
        extract_object_path_array(val).context("Failed to parse Devices property")
    }

    /// Load a simulated device (daemon built with dev-hooks only).
    pub async fn load_test_device(&self, json: &str) -> Result<String> {
        let reply = self
            .call(MANAGER_PATH, MANAGER_IFACE, "LoadTestDevice", &(json,))
            .await?;
        let path: zbus::zvariant::OwnedObjectPath = reply.body().deserialize()?;
        Ok(path.to_string())
    }

    pub async fn reset_test_device(&self) -> Result<()> {
        self.call(MANAGER_PATH, MANAGER_IFACE, "ResetTestDevice", &())
            .await?;
        Ok(())
    }

    /// Resolve a device specifier (numeric index or sysname substring) to
    /// its object path.
    pub async fn resolve_device(&self, spec: &str) -> Result<String> {
        let devices = self.list_devices().await?;
        resolve_in(&devices, spec)
    }

    pub async fn get_name(&self, path: &str) -> Result<String> {
        let val = self.get_property(path, DEVICE_IFACE, "Name").await?;
        String::try_from(val).context("Type mismatch for Name")
    }

    pub async fn get_u32(&self, path: &str, prop: &str) -> Result<u32> {
        let val = self.get_property(path, DEVICE_IFACE, prop).await?;
        u32::try_from(val).with_context(|| format!("Type mismatch for {prop}"))
    }

    pub async fn get_u64(&self, path: &str, prop: &str) -> Result<u64> {
        let val = self.get_property(path, DEVICE_IFACE, prop).await?;
        u64::try_from(val).with_context(|| format!("Type mismatch for {prop}"))
    }

    pub async fn get_profiles(&self, path: &str) -> Result<Vec<ProfileInfo>> {
        let val = self.get_property(path, DEVICE_IFACE, "Profiles").await?;
        extract_profiles(val).context("Failed to parse Profiles property")
    }

    pub async fn read_attribute(&self, path: &str, name: &str) -> Result<String> {
        let reply = self
            .call(path, DEVICE_IFACE, "ReadAttribute", &(name,))
            .await?;
        Ok(reply.body().deserialize()?)
    }

    /// Returns the number of bytes the daemon consumed.
    pub async fn write_attribute(&self, path: &str, name: &str, value: &str) -> Result<u32> {
        let reply = self
            .call(path, DEVICE_IFACE, "WriteAttribute", &(name, value))
            .await?;
        Ok(reply.body().deserialize()?)
    }

    pub async fn switch_profile(&self, path: &str) -> Result<u32> {
        let reply = self.call(path, DEVICE_IFACE, "SwitchProfile", &()).await?;
        Ok(reply.body().deserialize()?)
    }

    pub async fn query_firmware(&self, path: &str) -> Result<()> {
        self.call(path, DEVICE_IFACE, "QueryFirmware", &()).await?;
        Ok(())
    }

    async fn call<B>(&self, path: &str, iface: &str, method: &str, body: &B) -> Result<zbus::Message>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
    {
        self.conn
            .call_method(Some(BUS_NAME), path, Some(iface), method, body)
            .await
            .with_context(|| format!("{method} call on {path} failed"))
    }

    async fn get_property(&self, path: &str, iface: &str, prop: &str) -> Result<OwnedValue> {
        let reply = self
            .call(path, "org.freedesktop.DBus.Properties", "Get", &(iface, prop))
            .await
            .with_context(|| format!("Get {iface}.{prop} failed"))?;
        let val: OwnedValue = reply.body().deserialize()?;
        Ok(val)
    }
}

/* Index first, then a substring of the object path. */
fn resolve_in(devices: &[String], spec: &str) -> Result<String> {
    anyhow::ensure!(!devices.is_empty(), "No devices found");

    if let Ok(idx) = spec.parse::<usize>() {
        return devices
            .get(idx)
            .cloned()
            .with_context(|| format!("Device index {idx} out of range (0..{})", devices.len()));
    }

    devices
        .iter()
        .find(|path| path.ends_with(spec) || path.contains(spec))
        .cloned()
        .ok_or_else(|| anyhow!("No device matching '{spec}' found"))
}

fn extract_object_path_array(val: OwnedValue) -> Result<Vec<String>> {
    let inner: Value<'_> = val.into();
    match inner {
        Value::Array(arr) => arr
            .iter()
            .map(|item| match item {
                Value::ObjectPath(p) => Ok(p.to_string()),
                _ => Err(anyhow!("Array contains non-object-path value")),
            })
            .collect(),
        _ => Err(anyhow!("Value is not an array of object paths")),
    }
}

fn extract_profiles(val: OwnedValue) -> Result<Vec<ProfileInfo>> {
    let inner: Value<'_> = val.into();
    let Value::Array(arr) = inner else {
        return Err(anyhow!("Value is not an array"));
    };

    arr.iter()
        .map(|item| {
            let Value::Structure(s) = item else {
                return Err(anyhow!("Array contains non-struct value"));
            };
            let fields: Vec<u32> = s
                .fields()
                .iter()
                .map(|f| match f {
                    Value::U32(n) => Ok(*n),
                    _ => Err(anyhow!("Profile field is not u32")),
                })
                .collect::<Result<_>>()?;
            match fields[..] {
                [index, report_rate, dpi, rgb] => Ok(ProfileInfo {
                    index,
                    report_rate,
                    dpi,
                    rgb,
                }),
                _ => Err(anyhow!("Profile has {} fields, expected 4", fields.len())),
            }
        })
        .collect()
}

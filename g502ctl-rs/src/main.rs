/* g502ctl CLI: clap-driven client that talks to g502d over DBus to list
 * devices, read and write report rate and DPI, cycle profiles and drive
 * dev-hook test devices. */
mod dbus_client;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use dbus_client::G502Client;

/// g502ctl: configure a G502 HERO through the g502d DBus daemon.
#[derive(Parser)]
#[command(name = "g502ctl", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached devices.
    List,

    /// Show the profiles and transmit counters of a device.
    Info {
        /// Device index (0-based, from `g502ctl list`) or sysname.
        device: String,
    },

    /// Show or set the report rate of the current profile.
    Rate {
        /// Device index or sysname.
        device: String,
        /// Report rate in Hz (125, 250, 500 or 1000). Omit to show.
        hz: Option<String>,
    },

    /// Show or set the DPI of the current profile.
    Dpi {
        /// Device index or sysname.
        device: String,
        /// DPI value (1-25600). Omit to show.
        dpi: Option<String>,
    },

    /// Advance to the next profile and push it to the device.
    Switch {
        /// Device index or sysname.
        device: String,
    },

    /// Request the firmware version (logged by the daemon).
    Firmware {
        /// Device index or sysname.
        device: String,
    },

    /// Dev-hooks test commands (requires daemon built with dev-hooks).
    #[command(subcommand)]
    Test(TestCmd),
}

#[derive(Subcommand)]
enum TestCmd {
    /// Load a simulated device from a JSON file.
    #[command(name = "load-device")]
    LoadDevice {
        /// Path to a JSON file describing the test device.
        json_file: String,
    },
    /// Remove all test devices.
    Reset,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = G502Client::connect()
        .await
        .context("Failed to connect to g502d on org.g502d1")?;

    match cli.command {
        Commands::List => cmd_list(&client).await,
        Commands::Info { device } => cmd_info(&client, &device).await,
        Commands::Rate { device, hz } => {
            cmd_attribute(&client, &device, "report_rate", "Hz", hz.as_deref()).await
        }
        Commands::Dpi { device, dpi } => {
            cmd_attribute(&client, &device, "dpi", "DPI", dpi.as_deref()).await
        }
        Commands::Switch { device } => cmd_switch(&client, &device).await,
        Commands::Firmware { device } => cmd_firmware(&client, &device).await,
        Commands::Test(sub) => match sub {
            TestCmd::LoadDevice { json_file } => cmd_test_load_device(&client, &json_file).await,
            TestCmd::Reset => cmd_test_reset(&client).await,
        },
    }
}

async fn cmd_list(client: &G502Client) -> Result<()> {
    let api = client.get_api_version().await.unwrap_or(-1);
    let devices = client.list_devices().await?;
    if devices.is_empty() {
        println!("No devices found. (API version {})", api);
        return Ok(());
    }
    println!("API version: {}", api);
    for (i, path) in devices.iter().enumerate() {
        let name = client.get_name(path).await.unwrap_or_default();
        println!("{}: {} ({})", i, name, path);
    }
    Ok(())
}

async fn cmd_info(client: &G502Client, device: &str) -> Result<()> {
    let path = client.resolve_device(device).await?;
    let name = client.get_name(&path).await?;
    let active = client.get_u32(&path, "ActiveProfile").await?;
    let profiles = client.get_profiles(&path).await?;
    let sent = client.get_u64(&path, "PacketsSent").await?;
    let failed = client.get_u64(&path, "PacketsFailed").await?;

    println!("Device:    {}", name);
    println!("Packets:   {} sent, {} failed", sent, failed);
    println!("Profiles:  {}", profiles.len());
    for p in &profiles {
        println!(
            "  Profile {}: rate={}Hz dpi={} color=#{:06x}{}",
            p.index,
            p.report_rate,
            p.dpi,
            p.rgb,
            if p.index == active { " [active]" } else { "" }
        );
    }
    Ok(())
}

async fn cmd_attribute(
    client: &G502Client,
    device: &str,
    attribute: &str,
    unit: &str,
    value: Option<&str>,
) -> Result<()> {
    let path = client.resolve_device(device).await?;
    match value {
        None => {
            let current = client.read_attribute(&path, attribute).await?;
            println!("{} {}", current.trim_end(), unit);
        }
        Some(value) => {
            client.write_attribute(&path, attribute, value).await?;
            println!("{} set to {} {}.", attribute, value, unit);
        }
    }
    Ok(())
}

async fn cmd_switch(client: &G502Client, device: &str) -> Result<()> {
    let path = client.resolve_device(device).await?;
    let index = client.switch_profile(&path).await?;
    let profiles = client.get_profiles(&path).await?;
    match profiles.iter().find(|p| p.index == index) {
        Some(p) => println!(
            "Switched to profile {} ({}Hz, {} DPI).",
            index, p.report_rate, p.dpi
        ),
        None => println!("Switched to profile {}.", index),
    }
    Ok(())
}

async fn cmd_firmware(client: &G502Client, device: &str) -> Result<()> {
    let path = client.resolve_device(device).await?;
    client.query_firmware(&path).await?;
    println!("Firmware query sent; the version is reported in the daemon log.");
    Ok(())
}

async fn cmd_test_load_device(client: &G502Client, json_file: &str) -> Result<()> {
    let json = std::fs::read_to_string(json_file)
        .with_context(|| format!("Cannot read file '{}'", json_file))?;
    let path = client.load_test_device(&json).await?;
    println!("Test device loaded at {}.", path);
    Ok(())
}

async fn cmd_test_reset(client: &G502Client) -> Result<()> {
    client.reset_test_device().await?;
    println!("All test devices removed.");
    Ok(())
}

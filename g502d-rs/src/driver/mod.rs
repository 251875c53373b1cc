pub mod g502;
pub mod hidpp;

use std::ffi::c_int;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use thiserror::Error;
use tracing::{debug, info, warn};

/* Largest report the hidraw node can hand us (very long HID++ frame) */
const MAX_REPORT_LEN: usize = 64;

/* How long one poll waits before re-checking the shutdown flag */
const READ_POLL_TIMEOUT_MS: u16 = 250;

/* HID_MAX_DESCRIPTOR_SIZE from linux/hid.h */
const HID_MAX_DESCRIPTOR_SIZE: usize = 4096;

#[repr(C)]
struct HidrawReportDescriptor {
    size: u32,
    value: [u8; HID_MAX_DESCRIPTOR_SIZE],
}

nix::ioctl_read!(hidraw_rdesc_size, b'H', 0x01, c_int);
nix::ioctl_read!(hidraw_rdesc, b'H', 0x02, HidrawReportDescriptor);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Short write on {path}: {written} of {expected} bytes")]
    ShortWrite {
        path: PathBuf,
        written: usize,
        expected: usize,
    },

    #[error("ioctl {request} failed on {path}: {errno}")]
    Ioctl {
        path: PathBuf,
        request: &'static str,
        errno: Errno,
    },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Device rejected report: {0}")]
    Rejected(String),
}

/* The outbound half of the transport boundary. */
/*  */
/* `send_blocking` may sleep until the device acknowledges the report, so it */
/* must only be called from a context where blocking is allowed (the */
/* dispatch worker thread). Responses never come back through this call: */
/* they arrive later on the inbound report path. */
pub trait Transport: Send + Sync {
    /* Returns the transport name for logging purposes. */
    fn name(&self) -> &str;

    fn send_blocking(&self, report_id: u8, report: &[u8]) -> Result<(), TransportError>;
}

/* Blocking wrapper around a `/dev/hidraw` file descriptor. */
/*  */
/* All hardware I/O goes through this struct so that the protocol code */
/* never touches raw file handles directly. */
pub struct HidrawIo {
    file: File,
    path: PathBuf,
}

impl HidrawIo {
    /* Open the hidraw device node at `path`. */
    pub fn open(path: &Path) -> Result<Self, TransportError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| TransportError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /* Fetch the raw HID report descriptor the kernel parsed for this node. */
    pub fn report_descriptor(&self) -> Result<Vec<u8>, TransportError> {
        let fd = self.file.as_raw_fd();

        let mut size: c_int = 0;
        /* SAFETY: `fd` is a valid open hidraw descriptor and `size` outlives the call */
        unsafe { hidraw_rdesc_size(fd, &mut size) }.map_err(|errno| TransportError::Ioctl {
            path: self.path.clone(),
            request: "HIDIOCGRDESCSIZE",
            errno,
        })?;

        let len = usize::try_from(size)
            .unwrap_or(0)
            .min(HID_MAX_DESCRIPTOR_SIZE);
        let mut desc = Box::new(HidrawReportDescriptor {
            size: len as u32,
            value: [0u8; HID_MAX_DESCRIPTOR_SIZE],
        });

        /* SAFETY: `desc` is a properly sized `struct hidraw_report_descriptor` */
        unsafe { hidraw_rdesc(fd, &mut *desc) }.map_err(|errno| TransportError::Ioctl {
            path: self.path.clone(),
            request: "HIDIOCGRDESC",
            errno,
        })?;

        Ok(desc.value[..len].to_vec())
    }

    /* Start a dedicated thread that delivers every inbound report to `on_report`. */
    pub fn spawn_reader<F>(&self, on_report: F) -> Result<ReportReader, TransportError>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let io_err = |source| TransportError::Io {
            path: self.path.clone(),
            source,
        };

        let file = self.file.try_clone().map_err(io_err)?;
        let path = self.path.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let thread_name = format!(
            "rx-{}",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );

        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_reader_loop(file, path, flag, on_report))
            .map_err(io_err)?;

        Ok(ReportReader {
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Transport for HidrawIo {
    fn name(&self) -> &str {
        "hidraw"
    }

    fn send_blocking(&self, report_id: u8, report: &[u8]) -> Result<(), TransportError> {
        let mut writer = &self.file;
        let written = writer.write(report).map_err(|source| match source.raw_os_error() {
            Some(code) if code == Errno::ENODEV as i32 => TransportError::Disconnected,
            _ => TransportError::Io {
                path: self.path.clone(),
                source,
            },
        })?;

        if written != report.len() {
            return Err(TransportError::ShortWrite {
                path: self.path.clone(),
                written,
                expected: report.len(),
            });
        }

        debug!("TX 0x{report_id:02x} {} bytes: {:02x?}", report.len(), report);
        Ok(())
    }
}

/* Handle to a running inbound report thread. */
pub struct ReportReader {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReportReader {
    /* Stop delivering reports and wait for the thread to exit. */
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Report reader thread panicked");
        }
    }
}

impl Drop for ReportReader {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn run_reader_loop<F>(file: File, path: PathBuf, shutdown: Arc<AtomicBool>, mut on_report: F)
where
    F: FnMut(&[u8]),
{
    debug!("Report reader started for {}", path.display());
    let mut buf = [0u8; MAX_REPORT_LEN];
    let mut reader = &file;

    while !shutdown.load(Ordering::Relaxed) {
        let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, READ_POLL_TIMEOUT_MS) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => {
                warn!("poll failed on {}: {e}", path.display());
                break;
            }
        }

        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            info!("{} hung up", path.display());
            break;
        }

        match reader.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                debug!("RX {} bytes: {:02x?}", n, &buf[..n]);
                on_report(&buf[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Read failed on {}: {e}", path.display());
                break;
            }
        }
    }

    debug!("Report reader exited for {}", path.display());
}

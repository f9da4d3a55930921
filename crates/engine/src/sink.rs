//! Frame sinks: where finished frames go.
//!
//! A sink is write-only and fire-and-forget. The engine logs and counts a
//! failed write but never stops a program because of one; only opening the
//! device at startup is fatal.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

/// Default serial line speed.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Destination for frames.
pub trait FrameSink: Send {
    /// Transmit one complete frame.
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Device open/configure failures. Fatal at startup only.
#[derive(Debug)]
pub enum HardwareError {
    Open { path: PathBuf, source: io::Error },
    Configure { path: PathBuf, source: io::Error },
    UnsupportedBaud(u32),
}

impl fmt::Display for HardwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareError::Open { path, source } => {
                write!(f, "cannot open {}: {}", path.display(), source)
            }
            HardwareError::Configure { path, source } => {
                write!(f, "cannot configure {}: {}", path.display(), source)
            }
            HardwareError::UnsupportedBaud(baud) => write!(f, "unsupported baud rate {}", baud),
        }
    }
}

impl std::error::Error for HardwareError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HardwareError::Open { source, .. } | HardwareError::Configure { source, .. } => Some(source),
            HardwareError::UnsupportedBaud(_) => None,
        }
    }
}

/// Serial device in raw 8N1 mode.
///
/// If the path is not a terminal (a plain file or FIFO, say) it is written
/// as-is without line configuration.
pub struct SerialSink {
    file: File,
}

impl SerialSink {
    pub fn open(path: &Path, baud: u32) -> Result<Self, HardwareError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| HardwareError::Open { path: path.to_path_buf(), source })?;

        #[cfg(unix)]
        configure_raw(&file, path, baud)?;
        #[cfg(not(unix))]
        log::warn!("Serial line settings are not applied on this platform ({} baud requested)", baud);

        log::info!("Opened frame device {} at {} baud", path.display(), baud);
        Ok(Self { file })
    }
}

impl FrameSink for SerialSink {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.file.write_all(frame)
    }
}

#[cfg(unix)]
fn baud_constant(baud: u32) -> Option<libc::speed_t> {
    Some(match baud {
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        #[cfg(target_os = "linux")]
        460800 => libc::B460800,
        #[cfg(target_os = "linux")]
        921600 => libc::B921600,
        _ => return None,
    })
}

#[cfg(unix)]
fn configure_raw(file: &File, path: &Path, baud: u32) -> Result<(), HardwareError> {
    use std::os::unix::io::AsRawFd;

    let speed = baud_constant(baud).ok_or(HardwareError::UnsupportedBaud(baud))?;
    let fd = file.as_raw_fd();
    let configure_err = |source: io::Error| HardwareError::Configure { path: path.to_path_buf(), source };

    // SAFETY: fd is a valid open descriptor owned by `file` for this call.
    if unsafe { libc::isatty(fd) } != 1 {
        log::warn!("{} is not a terminal; writing frames without line configuration", path.display());
        return Ok(());
    }

    // SAFETY: termios is plain old data; tcgetattr fully initializes it on success.
    let mut tty: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(fd, &mut tty) } != 0 {
        return Err(configure_err(io::Error::last_os_error()));
    }

    // 8N1, no hardware flow control, receiver on, ignore modem lines
    tty.c_cflag &= !(libc::PARENB | libc::CSTOPB | libc::CSIZE | libc::CRTSCTS);
    tty.c_cflag |= libc::CS8 | libc::CREAD | libc::CLOCAL;

    tty.c_lflag &= !(libc::ICANON | libc::ECHO | libc::ECHOE | libc::ECHONL | libc::ISIG);
    tty.c_iflag &= !(libc::IXON | libc::IXOFF | libc::IXANY);
    tty.c_iflag &= !(libc::IGNBRK
        | libc::BRKINT
        | libc::PARMRK
        | libc::ISTRIP
        | libc::INLCR
        | libc::IGNCR
        | libc::ICRNL);
    tty.c_oflag &= !(libc::OPOST | libc::ONLCR);

    tty.c_cc[libc::VTIME] = 0;
    tty.c_cc[libc::VMIN] = 0;

    // SAFETY: tty is a valid termios obtained from tcgetattr above.
    unsafe {
        if libc::cfsetispeed(&mut tty, speed) != 0 || libc::cfsetospeed(&mut tty, speed) != 0 {
            return Err(configure_err(io::Error::last_os_error()));
        }
        if libc::tcsetattr(fd, libc::TCSANOW, &tty) != 0 {
            return Err(configure_err(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Sink that drops every frame. Used when no device is attached.
#[derive(Debug, Default)]
pub struct DiscardSink;

impl FrameSink for DiscardSink {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        log::trace!("Discarding {}-byte frame", frame.len());
        Ok(())
    }
}

/// Sink that keeps every frame in memory; clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all frames written so far.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn last(&self) -> Option<Vec<u8>> {
        self.frames.lock().last().cloned()
    }
}

impl FrameSink for RecordingSink {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.frames.lock().push(frame.to_vec());
        Ok(())
    }
}

//! Virtual input devices.
//!
//! Each mandelbox gets three virtual input devices created through
//! `/dev/uinput`: a keyboard, a relative-motion mouse, and an
//! absolute-position input (touch) device. The protocol inside the
//! mandelbox injects events by writing to the raw device file descriptors,
//! which the agent ships over a unix-domain socket in the mandelbox's temp
//! directory using `SCM_RIGHTS`. The socket lives until the mandelbox
//! closes.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use std::io::IoSlice;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MandelboxError, Result};

const UINPUT_PATH: &str = "/dev/uinput";
const UINPUT_NAME_SIZE: usize = 80;
const ABS_SIZE: usize = 64;

// Legacy uinput ioctl interface.
const UI_SET_EVBIT: libc::c_ulong = 0x4004_5564;
const UI_SET_KEYBIT: libc::c_ulong = 0x4004_5565;
const UI_SET_RELBIT: libc::c_ulong = 0x4004_5566;
const UI_SET_ABSBIT: libc::c_ulong = 0x4004_5567;
const UI_DEV_CREATE: libc::c_ulong = 0x5501;
const UI_DEV_DESTROY: libc::c_ulong = 0x5502;
// _IOC(_IOC_READ, 'U', 44, 64): fetch the sysfs name of the created device.
const UI_GET_SYSNAME_64: libc::c_ulong = 0x8040_552c;

const EV_KEY: libc::c_int = 0x01;
const EV_REL: libc::c_int = 0x02;
const EV_ABS: libc::c_int = 0x03;

const REL_X: libc::c_int = 0x00;
const REL_Y: libc::c_int = 0x01;
const REL_WHEEL: libc::c_int = 0x08;

const ABS_X: libc::c_int = 0x00;
const ABS_Y: libc::c_int = 0x01;

const BTN_LEFT: libc::c_int = 0x110;
const BTN_RIGHT: libc::c_int = 0x111;
const BTN_MIDDLE: libc::c_int = 0x112;
const BTN_TOUCH: libc::c_int = 0x14a;

/// Highest keyboard key code registered on the virtual keyboard.
const KEY_MAX_REGISTERED: libc::c_int = 248;

/// Absolute axis resolution of the touch device.
const ABS_AXIS_MAX: i32 = 0xFFF;

#[repr(C)]
struct InputId {
    bustype: u16,
    vendor: u16,
    product: u16,
    version: u16,
}

#[repr(C)]
struct UinputUserDev {
    name: [u8; UINPUT_NAME_SIZE],
    id: InputId,
    ff_effects_max: u32,
    absmax: [i32; ABS_SIZE],
    absmin: [i32; ABS_SIZE],
    absfuzz: [i32; ABS_SIZE],
    absflat: [i32; ABS_SIZE],
}

impl UinputUserDev {
    fn new(name: &str) -> Self {
        let mut dev = Self {
            name: [0; UINPUT_NAME_SIZE],
            id: InputId {
                bustype: 0x03, // BUS_USB
                vendor: 0x1,
                product: 0x1,
                version: 1,
            },
            ff_effects_max: 0,
            absmax: [0; ABS_SIZE],
            absmin: [0; ABS_SIZE],
            absfuzz: [0; ABS_SIZE],
            absflat: [0; ABS_SIZE],
        };
        let bytes = name.as_bytes();
        let len = bytes.len().min(UINPUT_NAME_SIZE - 1);
        dev.name[..len].copy_from_slice(&bytes[..len]);
        dev
    }
}

/// One created virtual device.
pub struct UinputDevice {
    /// Device name as registered with the kernel.
    pub name: String,
    /// The uinput control fd; closing it destroys the device.
    pub fd: OwnedFd,
    /// Resolved `/dev/input/eventN` node, when discoverable.
    pub device_node: Option<PathBuf>,
}

impl Drop for UinputDevice {
    fn drop(&mut self) {
        // Destroy before the fd closes so the kernel removes the node
        // promptly rather than on fd teardown.
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), UI_DEV_DESTROY) };
        if rc < 0 {
            debug!(name = %self.name, "UI_DEV_DESTROY failed (device may already be gone)");
        }
    }
}

/// The three devices handed to one mandelbox.
pub struct UinputDevices {
    pub keyboard: UinputDevice,
    pub mouse: UinputDevice,
    pub absinput: UinputDevice,
}

impl UinputDevices {
    /// Container device mappings for every resolved device node, granting
    /// read/write (no mknod) inside the mandelbox.
    #[must_use]
    pub fn device_mappings(&self) -> Vec<DeviceMapping> {
        [&self.keyboard, &self.mouse, &self.absinput]
            .into_iter()
            .filter_map(|device| {
                device.device_node.as_ref().map(|node| DeviceMapping {
                    path_on_host: node.clone(),
                    path_in_mandelbox: node.clone(),
                    cgroup_permissions: "rwm".to_owned(),
                })
            })
            .collect()
    }

    fn raw_fds(&self) -> [std::os::fd::RawFd; 3] {
        [
            self.keyboard.fd.as_raw_fd(),
            self.mouse.fd.as_raw_fd(),
            self.absinput.fd.as_raw_fd(),
        ]
    }
}

/// A host device exposed inside a mandelbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMapping {
    pub path_on_host: PathBuf,
    pub path_in_mandelbox: PathBuf,
    pub cgroup_permissions: String,
}

fn ioctl_set(fd: &OwnedFd, request: libc::c_ulong, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), request, value) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn open_uinput() -> Result<OwnedFd> {
    let file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(UINPUT_PATH)
        .map_err(|e| MandelboxError::Uinput(format!("opening {UINPUT_PATH}: {e}")))?;
    Ok(file.into())
}

fn register_and_create(fd: &OwnedFd, name: &str) -> Result<()> {
    let dev = UinputUserDev::new(name);
    let bytes = unsafe {
        std::slice::from_raw_parts(
            std::ptr::from_ref(&dev).cast::<u8>(),
            std::mem::size_of::<UinputUserDev>(),
        )
    };
    let written = unsafe { libc::write(fd.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
    if written != bytes.len() as isize {
        return Err(MandelboxError::Uinput(format!(
            "writing device descriptor for {name}: {}",
            io::Error::last_os_error()
        )));
    }
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), UI_DEV_CREATE) };
    if rc < 0 {
        return Err(MandelboxError::Uinput(format!(
            "UI_DEV_CREATE for {name}: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Resolves the `/dev/input/eventN` node of a freshly created device via its
/// sysfs name. Absence is tolerated; the mapping is just omitted.
fn resolve_device_node(fd: &OwnedFd) -> Option<PathBuf> {
    let mut sysname = [0u8; 64];
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), UI_GET_SYSNAME_64, sysname.as_mut_ptr()) };
    if rc < 0 {
        return None;
    }
    let end = sysname.iter().position(|b| *b == 0).unwrap_or(sysname.len());
    let sysname = std::str::from_utf8(&sysname[..end]).ok()?;

    let sys_dir = PathBuf::from("/sys/devices/virtual/input").join(sysname);
    let entries = std::fs::read_dir(sys_dir).ok()?;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if let Some(event) = file_name.strip_prefix("event") {
            if event.chars().all(|c| c.is_ascii_digit()) {
                return Some(PathBuf::from("/dev/input").join(file_name.as_ref()));
            }
        }
    }
    None
}

fn create_keyboard(mandelbox_id: &str) -> Result<UinputDevice> {
    let fd = open_uinput()?;
    let name = format!("fleetbox-keyboard-{mandelbox_id}");
    ioctl_set(&fd, UI_SET_EVBIT, EV_KEY)
        .map_err(|e| MandelboxError::Uinput(format!("keyboard EV_KEY: {e}")))?;
    for key in 1..=KEY_MAX_REGISTERED {
        ioctl_set(&fd, UI_SET_KEYBIT, key)
            .map_err(|e| MandelboxError::Uinput(format!("keyboard key {key}: {e}")))?;
    }
    register_and_create(&fd, &name)?;
    let device_node = resolve_device_node(&fd);
    Ok(UinputDevice { name, fd, device_node })
}

fn create_mouse(mandelbox_id: &str) -> Result<UinputDevice> {
    let fd = open_uinput()?;
    let name = format!("fleetbox-mouse-{mandelbox_id}");
    for (request, value) in [
        (UI_SET_EVBIT, EV_KEY),
        (UI_SET_KEYBIT, BTN_LEFT),
        (UI_SET_KEYBIT, BTN_RIGHT),
        (UI_SET_KEYBIT, BTN_MIDDLE),
        (UI_SET_EVBIT, EV_REL),
        (UI_SET_RELBIT, REL_X),
        (UI_SET_RELBIT, REL_Y),
        (UI_SET_RELBIT, REL_WHEEL),
    ] {
        ioctl_set(&fd, request, value)
            .map_err(|e| MandelboxError::Uinput(format!("mouse setup: {e}")))?;
    }
    register_and_create(&fd, &name)?;
    let device_node = resolve_device_node(&fd);
    Ok(UinputDevice { name, fd, device_node })
}

fn create_absinput(mandelbox_id: &str) -> Result<UinputDevice> {
    let fd = open_uinput()?;
    let name = format!("fleetbox-absinput-{mandelbox_id}");
    for (request, value) in [
        (UI_SET_EVBIT, EV_KEY),
        (UI_SET_KEYBIT, BTN_TOUCH),
        (UI_SET_KEYBIT, BTN_LEFT),
        (UI_SET_EVBIT, EV_ABS),
        (UI_SET_ABSBIT, ABS_X),
        (UI_SET_ABSBIT, ABS_Y),
    ] {
        ioctl_set(&fd, request, value)
            .map_err(|e| MandelboxError::Uinput(format!("absinput setup: {e}")))?;
    }

    let mut dev = UinputUserDev::new(&name);
    dev.absmax[ABS_X as usize] = ABS_AXIS_MAX;
    dev.absmax[ABS_Y as usize] = ABS_AXIS_MAX;
    let bytes = unsafe {
        std::slice::from_raw_parts(
            std::ptr::from_ref(&dev).cast::<u8>(),
            std::mem::size_of::<UinputUserDev>(),
        )
    };
    let written = unsafe { libc::write(fd.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
    if written != bytes.len() as isize {
        return Err(MandelboxError::Uinput(format!(
            "writing absinput descriptor: {}",
            io::Error::last_os_error()
        )));
    }
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), UI_DEV_CREATE) };
    if rc < 0 {
        return Err(MandelboxError::Uinput(format!(
            "UI_DEV_CREATE for {name}: {}",
            io::Error::last_os_error()
        )));
    }
    let device_node = resolve_device_node(&fd);
    Ok(UinputDevice { name, fd, device_node })
}

/// Creates the keyboard, mouse, and absolute-input devices for one
/// mandelbox.
///
/// # Errors
///
/// Fails when `/dev/uinput` is unavailable or any registration ioctl is
/// rejected. Devices created before the failure are destroyed on drop.
pub fn create_devices(mandelbox_id: &str) -> Result<UinputDevices> {
    let keyboard = create_keyboard(mandelbox_id)?;
    let mouse = create_mouse(mandelbox_id)?;
    let absinput = create_absinput(mandelbox_id)?;
    info!(mandelbox_id, "created virtual input devices");
    Ok(UinputDevices { keyboard, mouse, absinput })
}

/// Serves the three device fds on a unix socket until cancelled.
///
/// The protocol inside the mandelbox connects once at startup; every
/// accepted connection receives all three fds in one `SCM_RIGHTS` message.
/// The socket file is removed when the task ends.
///
/// # Errors
///
/// Fails when the socket cannot be bound.
pub fn spawn_fd_server(
    socket_path: &Path,
    devices: &UinputDevices,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| MandelboxError::Uinput(format!("creating socket dir: {e}")))?;
    }
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)
        .map_err(|e| MandelboxError::Uinput(format!("binding {}: {e}", socket_path.display())))?;

    let fds = devices.raw_fds();
    let socket_path = socket_path.to_path_buf();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            // One byte of payload so the peer's recvmsg has
                            // data to wait on; the fds ride the ancillary
                            // message.
                            let iov = [IoSlice::new(&[0u8])];
                            let cmsg = [ControlMessage::ScmRights(&fds)];
                            let result = sendmsg::<()>(
                                stream.as_raw_fd(),
                                &iov,
                                &cmsg,
                                MsgFlags::empty(),
                                None,
                            );
                            if let Err(e) = result {
                                warn!(error = %e, "failed to ship uinput fds");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "uinput socket accept failed");
                            break;
                        }
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
        let _ = std::fs::remove_file(&socket_path);
    });
    Ok(handle)
}

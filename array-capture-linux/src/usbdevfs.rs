//! `UsbTransport` over Linux usbdevfs (`/dev/bus/usb/BBB/DDD`).
//!
//! The host opens the device node (it owns enumeration and
//! permissions) and hands the file descriptor over; everything here is
//! ioctls on that fd. Isochronous URBs are submitted with their packet
//! descriptor array allocated inline after the URB header, which is
//! the layout the kernel expects, and correlated back to engine slots
//! through `usercontext` carrying the slot index. Reaped pointers are
//! never dereferenced as buffers; the slot index is bounds-checked and
//! results are copied into the engine-owned block.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use libc::{c_int, c_uchar, c_uint, c_ulong, c_void};

use array_capture_core::models::config::BusSpeed;
use array_capture_core::models::transfer::TransferBlock;
use array_capture_core::traits::usb_transport::{ControlRequest, TransportError, UsbTransport};

/// Hard ceiling on packets per URB; sized into every slot allocation.
pub const MAX_PACKETS_PER_URB: usize = 32;

/// Wait bound for one blocking reap.
const REAP_POLL_TIMEOUT_MS: c_int = 100;

const URB_TYPE_ISO: c_uchar = 0;
const URB_ISO_ASAP: c_uint = 0x02;

// include/uapi/linux/usbdevice_fs.h
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct UsbdevfsIsoPacketDesc {
    length: c_uint,
    actual_length: c_uint,
    status: c_uint,
}

#[repr(C)]
struct UsbdevfsUrb {
    urb_type: c_uchar,
    endpoint: c_uchar,
    status: c_int,
    flags: c_uint,
    buffer: *mut c_void,
    buffer_length: c_int,
    actual_length: c_int,
    start_frame: c_int,
    number_of_packets: c_int,
    error_count: c_int,
    signr: c_uint,
    usercontext: *mut c_void,
}

#[repr(C)]
struct UsbdevfsCtrltransfer {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    timeout: u32,
    data: *mut c_void,
}

#[repr(C)]
struct UsbdevfsSetinterface {
    interface: c_uint,
    altsetting: c_uint,
}

/// One URB with its packet descriptors inline, as the kernel reads it.
#[repr(C)]
struct UrbWithPackets {
    urb: UsbdevfsUrb,
    descs: [UsbdevfsIsoPacketDesc; MAX_PACKETS_PER_URB],
}

const fn ioc(dir: c_ulong, nr: c_ulong, size: c_ulong) -> c_ulong {
    (dir << 30) | (size << 16) | ((b'U' as c_ulong) << 8) | nr
}
const fn io(nr: c_ulong) -> c_ulong {
    ioc(0, nr, 0)
}
const fn ior<T>(nr: c_ulong) -> c_ulong {
    ioc(2, nr, std::mem::size_of::<T>() as c_ulong)
}
const fn iow<T>(nr: c_ulong) -> c_ulong {
    ioc(1, nr, std::mem::size_of::<T>() as c_ulong)
}
const fn iowr<T>(nr: c_ulong) -> c_ulong {
    ioc(3, nr, std::mem::size_of::<T>() as c_ulong)
}

const USBDEVFS_CONTROL: c_ulong = iowr::<UsbdevfsCtrltransfer>(0);
const USBDEVFS_SETINTERFACE: c_ulong = ior::<UsbdevfsSetinterface>(4);
const USBDEVFS_SUBMITURB: c_ulong = ior::<UsbdevfsUrb>(10);
const USBDEVFS_DISCARDURB: c_ulong = io(11);
const USBDEVFS_REAPURB: c_ulong = iow::<*mut c_void>(12);
const USBDEVFS_REAPURBNDELAY: c_ulong = iow::<*mut c_void>(13);
const USBDEVFS_CLAIMINTERFACE: c_ulong = ior::<c_uint>(15);
const USBDEVFS_GET_SPEED: c_ulong = io(31);

// enum usb_device_speed in include/uapi/linux/usb/ch9.h
const USB_SPEED_FULL: c_int = 2;
const USB_SPEED_HIGH: c_int = 3;
const USB_SPEED_SUPER: c_int = 5;
const USB_SPEED_SUPER_PLUS: c_int = 6;

fn map_errno(errno: c_int) -> TransportError {
    match errno {
        libc::EAGAIN => TransportError::Again,
        libc::EBUSY => TransportError::Busy,
        libc::ETIMEDOUT => TransportError::Timeout,
        libc::ENODEV | libc::ESHUTDOWN => TransportError::Disconnected,
        libc::EPIPE => TransportError::Stall,
        _ => TransportError::Io(io::Error::from_raw_os_error(errno).to_string()),
    }
}

fn last_errno() -> c_int {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// usbdevfs-backed `UsbTransport`.
pub struct UsbdevfsTransport {
    fd: OwnedFd,
    speed: BusSpeed,
    /// Kernel-visible URB storage, indexed by engine slot. A slot's box
    /// must not move or drop while its URB is in flight, so entries are
    /// allocated once and reused.
    slots: Vec<Option<Box<UrbWithPackets>>>,
}

// SAFETY: the raw pointers inside `UrbWithPackets` refer to buffers the
// engine owns and keeps alive; the transport itself is only ever driven
// from one thread at a time (&mut self everywhere).
unsafe impl Send for UsbdevfsTransport {}

impl UsbdevfsTransport {
    /// Wrap an opened usbdevfs device node.
    pub fn from_fd(fd: OwnedFd) -> Result<Self, TransportError> {
        let speed = query_speed(&fd)?;
        log::info!("usbdevfs device attached at {speed:?} speed");
        Ok(Self {
            fd,
            speed,
            slots: Vec::new(),
        })
    }

    fn ioctl(&self, request: c_ulong, arg: *mut c_void) -> Result<c_int, TransportError> {
        // SAFETY: fd is a valid usbdevfs descriptor and `arg` points to
        // a live object of the type the request encodes.
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), request, arg) };
        if ret < 0 {
            return Err(map_errno(last_errno()));
        }
        Ok(ret)
    }

    fn control(
        &mut self,
        req: &ControlRequest,
        data: *mut c_void,
        length: u16,
    ) -> Result<usize, TransportError> {
        let mut transfer = UsbdevfsCtrltransfer {
            request_type: req.request_type,
            request: req.request,
            value: req.value,
            index: req.index,
            length,
            timeout: req.timeout_ms,
            data,
        };
        let n = self.ioctl(USBDEVFS_CONTROL, &mut transfer as *mut _ as *mut c_void)?;
        Ok(n as usize)
    }

    fn slot_mut(&mut self, slot: usize) -> &mut UrbWithPackets {
        if self.slots.len() <= slot {
            self.slots.resize_with(slot + 1, || None);
        }
        self.slots[slot].get_or_insert_with(|| {
            Box::new(UrbWithPackets {
                urb: UsbdevfsUrb {
                    urb_type: URB_TYPE_ISO,
                    endpoint: 0,
                    status: 0,
                    flags: URB_ISO_ASAP,
                    buffer: std::ptr::null_mut(),
                    buffer_length: 0,
                    actual_length: 0,
                    start_frame: 0,
                    number_of_packets: 0,
                    error_count: 0,
                    signr: 0,
                    usercontext: std::ptr::null_mut(),
                },
                descs: [UsbdevfsIsoPacketDesc::default(); MAX_PACKETS_PER_URB],
            })
        })
    }

    /// One REAPURBNDELAY; copies packet results into the owning block.
    fn reap_ndelay(&mut self, pool: &mut [TransferBlock]) -> Result<Option<usize>, TransportError> {
        let mut reaped: *mut UsbdevfsUrb = std::ptr::null_mut();
        match self.ioctl(
            USBDEVFS_REAPURBNDELAY,
            &mut reaped as *mut _ as *mut c_void,
        ) {
            Ok(_) => {}
            Err(TransportError::Again) => return Ok(None),
            Err(e) => return Err(e),
        }
        if reaped.is_null() {
            return Ok(None);
        }

        // Only the slot index travels through the kernel and back; it
        // is validated before anything is touched.
        let slot = unsafe { (*reaped).usercontext } as usize;
        let stored = match self.slots.get(slot).and_then(|s| s.as_deref()) {
            Some(stored) if slot < pool.len() => stored,
            _ => {
                return Err(TransportError::Protocol(format!(
                    "reaped URB with unknown slot {slot}"
                )))
            }
        };

        let block = &mut pool[slot];
        let packets = block.packets.len().min(MAX_PACKETS_PER_URB);
        for (i, packet) in block.packets.iter_mut().take(packets).enumerate() {
            packet.actual_length = stored.descs[i].actual_length;
            packet.status = stored.descs[i].status as i32;
        }
        if stored.urb.status != 0 {
            log::trace!("slot {slot} completed with urb status {}", stored.urb.status);
        }
        Ok(Some(slot))
    }

    /// Wait until the fd signals a completion or the bound elapses.
    fn wait_for_completion(&self) -> Result<bool, TransportError> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLOUT | libc::POLLWRNORM,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let ret = unsafe { libc::poll(&mut pfd, 1, REAP_POLL_TIMEOUT_MS) };
        if ret < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                return Ok(false);
            }
            return Err(map_errno(errno));
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
            return Err(TransportError::Disconnected);
        }
        Ok(ret > 0)
    }
}

fn query_speed(fd: &OwnedFd) -> Result<BusSpeed, TransportError> {
    // SAFETY: GET_SPEED takes no argument and returns the speed enum.
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), USBDEVFS_GET_SPEED, 0) };
    if ret < 0 {
        return Err(map_errno(last_errno()));
    }
    Ok(classify_speed(ret))
}

fn classify_speed(raw: c_int) -> BusSpeed {
    match raw {
        USB_SPEED_SUPER | USB_SPEED_SUPER_PLUS => BusSpeed::Super,
        USB_SPEED_HIGH => BusSpeed::High,
        USB_SPEED_FULL => BusSpeed::Full,
        other => {
            log::warn!("unexpected usb_device_speed {other}; assuming full speed");
            BusSpeed::Full
        }
    }
}

impl UsbTransport for UsbdevfsTransport {
    fn speed(&self) -> BusSpeed {
        self.speed
    }

    fn control_in(
        &mut self,
        req: &ControlRequest,
        data: &mut [u8],
    ) -> Result<usize, TransportError> {
        self.control(req, data.as_mut_ptr() as *mut c_void, data.len() as u16)
    }

    fn control_out(&mut self, req: &ControlRequest, data: &[u8]) -> Result<usize, TransportError> {
        self.control(req, data.as_ptr() as *mut c_void, data.len() as u16)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        let mut arg = interface as c_uint;
        match self.ioctl(USBDEVFS_CLAIMINTERFACE, &mut arg as *mut _ as *mut c_void) {
            Ok(_) => Ok(()),
            // Already claimed on this fd; usable as-is.
            Err(TransportError::Busy) => {
                log::debug!("interface {interface} already claimed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn set_interface(&mut self, interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        let mut arg = UsbdevfsSetinterface {
            interface: interface as c_uint,
            altsetting: alt_setting as c_uint,
        };
        self.ioctl(USBDEVFS_SETINTERFACE, &mut arg as *mut _ as *mut c_void)?;
        Ok(())
    }

    fn submit(&mut self, block: &mut TransferBlock) -> Result<(), TransportError> {
        if block.packets.len() > MAX_PACKETS_PER_URB {
            return Err(TransportError::Protocol(format!(
                "{} packets exceeds the {MAX_PACKETS_PER_URB}-packet URB limit",
                block.packets.len()
            )));
        }

        let slot_index = block.slot;
        let endpoint = block.endpoint;
        let buffer = block.buffer.as_mut_ptr() as *mut c_void;
        let buffer_length = block.buffer.len() as c_int;
        let packet_lengths: Vec<c_uint> = block.packets.iter().map(|p| p.length).collect();

        let stored = self.slot_mut(slot_index);
        stored.urb.urb_type = URB_TYPE_ISO;
        stored.urb.endpoint = endpoint;
        stored.urb.status = 0;
        stored.urb.flags = URB_ISO_ASAP;
        stored.urb.buffer = buffer;
        stored.urb.buffer_length = buffer_length;
        stored.urb.actual_length = 0;
        stored.urb.start_frame = 0;
        stored.urb.number_of_packets = packet_lengths.len() as c_int;
        stored.urb.error_count = 0;
        stored.urb.usercontext = slot_index as *mut c_void;
        for (i, &length) in packet_lengths.iter().enumerate() {
            stored.descs[i] = UsbdevfsIsoPacketDesc {
                length,
                actual_length: 0,
                status: 0,
            };
        }

        let urb_ptr = &mut stored.urb as *mut UsbdevfsUrb as *mut c_void;
        self.ioctl(USBDEVFS_SUBMITURB, urb_ptr)?;
        Ok(())
    }

    fn reap(
        &mut self,
        blocking: bool,
        pool: &mut [TransferBlock],
    ) -> Result<Option<usize>, TransportError> {
        if let Some(slot) = self.reap_ndelay(pool)? {
            return Ok(Some(slot));
        }
        if !blocking {
            return Ok(None);
        }
        if !self.wait_for_completion()? {
            return Ok(None);
        }
        self.reap_ndelay(pool)
    }

    fn cancel(&mut self, block: &TransferBlock) -> Result<(), TransportError> {
        let Some(Some(stored)) = self.slots.get_mut(block.slot) else {
            return Ok(());
        };
        let urb_ptr = &mut stored.urb as *mut UsbdevfsUrb as *mut c_void;
        // SAFETY: the URB storage stays alive in `slots` regardless of
        // whether the kernel still tracks it.
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), USBDEVFS_DISCARDURB, urb_ptr) };
        if ret < 0 {
            let errno = last_errno();
            // Already completed or never submitted.
            if errno == libc::EINVAL {
                return Ok(());
            }
            return Err(map_errno(errno));
        }
        Ok(())
    }
}

//! Layer 2 access for the GOOSE outstation. The raw socket implementation
//! rides an AF_PACKET socket bound to the configured interface; the
//! in-memory pair backs the tests.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

/// Frame transport the publisher and subscriber share. `recv` blocks until
/// a frame arrives.
pub trait GooseLink: Send + Sync {
    fn send(&self, frame: &[u8]) -> io::Result<()>;
    fn recv(&self, buffer: &mut [u8]) -> io::Result<usize>;
    /// Hardware address frames are sourced from
    fn mac(&self) -> [u8; 6];
}

/// AF_PACKET socket on a named interface, receiving all protocols so the
/// VLAN wrapped variant is seen too.
pub struct RawEthernetLink {
    fd: RawFd,
    mac: [u8; 6],
}

impl RawEthernetLink {
    pub fn open(interface: &str) -> io::Result<Self> {
        let protocol = (libc::ETH_P_ALL as u16).to_be() as i32;
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut name = [0u8; libc::IFNAMSIZ];
        let bytes = interface.as_bytes();
        if bytes.len() >= libc::IFNAMSIZ {
            unsafe { libc::close(fd) };
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name too long",
            ));
        }
        name[..bytes.len()].copy_from_slice(bytes);

        let index = unsafe { libc::if_nametoindex(name.as_ptr() as *const libc::c_char) };
        if index == 0 {
            unsafe { libc::close(fd) };
            return Err(io::Error::last_os_error());
        }

        // Bind to the interface so send/recv need no per-frame addressing
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        addr.sll_ifindex = index as i32;
        let bound = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if bound < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        // Interface hardware address for the frame source field
        let mut request: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in request.ifr_name.iter_mut().zip(name.iter()) {
            *dst = *src as libc::c_char;
        }
        let result = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut request) };
        if result < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let mut mac = [0u8; 6];
        let hwaddr = unsafe { request.ifr_ifru.ifru_hwaddr.sa_data };
        for (dst, src) in mac.iter_mut().zip(hwaddr.iter()) {
            *dst = *src as u8;
        }

        Ok(Self { fd, mac })
    }
}

impl GooseLink for RawEthernetLink {
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        let written = unsafe {
            libc::send(
                self.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
            )
        };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv(&self, buffer: &mut [u8]) -> io::Result<usize> {
        let read = unsafe {
            libc::recv(
                self.fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                0,
            )
        };
        if read < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(read as usize)
    }

    fn mac(&self) -> [u8; 6] {
        self.mac
    }
}

impl Drop for RawEthernetLink {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Cross-connected pair of frame queues standing in for the wire.
#[cfg(test)]
pub struct InMemoryLink {
    mac: [u8; 6],
    tx: Sender<Vec<u8>>,
    rx: Mutex<Receiver<Vec<u8>>>,
}

#[cfg(test)]
impl InMemoryLink {
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = channel();
        let (b_tx, b_rx) = channel();
        (
            Self {
                mac: [0x02, 0, 0, 0, 0, 0x0A],
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
            Self {
                mac: [0x02, 0, 0, 0, 0, 0x0B],
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
        )
    }
}

#[cfg(test)]
impl GooseLink for InMemoryLink {
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
    }

    fn recv(&self, buffer: &mut [u8]) -> io::Result<usize> {
        let frame = self
            .rx
            .lock()
            .expect("link receiver poisoned")
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))?;
        let length = frame.len().min(buffer.len());
        buffer[..length].copy_from_slice(&frame[..length]);
        Ok(length)
    }

    fn mac(&self) -> [u8; 6] {
        self.mac
    }
}

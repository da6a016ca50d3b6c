//! File-descriptor passing over Unix-domain datagram sockets.
//!
//! Wraps `sendmsg`/`recvmsg` with a single `SCM_RIGHTS` control message.
//! The unsafe code is confined to the libc cmsg layout
//! (`CMSG_SPACE`/`CMSG_LEN`/`CMSG_DATA`); received descriptors come back
//! as `OwnedFd` so nothing leaks on an early return.
//!
//! Sockets stay unconnected: the serving side replies to whatever bound
//! address a request came from, so the sender address is threaded through
//! both directions here.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

/// Largest datagram either side will send. Hot-restart messages are tiny;
/// this is headroom, not a target.
pub const MAX_DATAGRAM: usize = 8192;

/// Control-message buffer sized for one descriptor, u64-aligned as
/// `cmsghdr` requires.
const CMSG_WORDS: usize = 8;

fn sockaddr_for(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path too long",
        ));
    }
    for (slot, byte) in addr.sun_path.iter_mut().zip(bytes) {
        *slot = *byte as libc::c_char;
    }
    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

/// Sends `payload` to the socket bound at `dest`, attaching `fd` as
/// `SCM_RIGHTS` ancillary data when present.
pub fn send_to_with_fd(
    socket: &UnixDatagram,
    payload: &[u8],
    dest: &Path,
    fd: Option<BorrowedFd<'_>>,
) -> io::Result<()> {
    let (mut addr, addr_len) = sockaddr_for(dest)?;

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut cmsg_buf = [0u64; CMSG_WORDS];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut addr as *mut libc::sockaddr_un as *mut libc::c_void;
    msg.msg_namelen = addr_len;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = fd {
        let fd_len = mem::size_of::<RawFd>() as u32;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(fd_len) } as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_len) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd.as_raw_fd());
        }
    }

    let sent = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, 0) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    if sent as usize != payload.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "short datagram send",
        ));
    }
    Ok(())
}

/// One received datagram: payload length, the sender's bound path (absent
/// for unbound senders), and an inherited descriptor if one rode along.
#[derive(Debug)]
pub struct Received {
    pub len: usize,
    pub peer: Option<PathBuf>,
    pub fd: Option<OwnedFd>,
}

/// Receives one datagram into `buf`, harvesting a passed descriptor and
/// the sender address. Non-blocking sockets surface `WouldBlock` here.
pub fn recv_from_with_fd(socket: &UnixDatagram, buf: &mut [u8]) -> io::Result<Received> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u64; CMSG_WORDS];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut addr as *mut libc::sockaddr_un as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = mem::size_of_val(&cmsg_buf) as _;

    let received = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fd = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let raw = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd);
                // only one descriptor is ever sent; first wins
                if fd.is_none() && raw >= 0 {
                    fd = Some(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(Received {
        len: received as usize,
        peer: peer_path(&addr, msg.msg_namelen),
        fd,
    })
}

fn peer_path(addr: &libc::sockaddr_un, namelen: libc::socklen_t) -> Option<PathBuf> {
    let prefix = mem::size_of::<libc::sa_family_t>();
    if (namelen as usize) <= prefix {
        return None;
    }
    let raw: Vec<u8> = addr.sun_path[..namelen as usize - prefix]
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    if raw.is_empty() {
        return None;
    }
    Some(PathBuf::from(std::ffi::OsString::from_vec(raw)))
}

// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! TCP consumer.
//!
//! Listens on a fixed loopback port, accepts one producer at a time, and
//! reassembles the frame stream. All socket reads poll with a short
//! timeout so shutdown is observable within the cancellation budget; a
//! read of zero bytes or a hard error tears the connection down and the
//! receiver returns to listening.

use std::io::{self, Read};
use std::mem;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info};

use framelink_protocol::region::{MAX_FRAME_SIZE, MAX_HEIGHT, MAX_WIDTH};
use framelink_protocol::wire::{FrameHeader, InitHeader, FRAME_HEADER_BYTES, INIT_HEADER_BYTES};
use framelink_protocol::{Frame, LinkError, Result, StreamConfig};

use crate::receiver::FrameHandler;

const POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Upper bound on a single frame payload; anything larger is an
/// impossible header. Padded strides may exceed the tight frame size, so
/// this is deliberately looser than `MAX_FRAME_SIZE`.
const MAX_DATA_SIZE: usize = 2 * MAX_FRAME_SIZE;

/// Creates a loopback listener with `SO_REUSEADDR` set before bind, so a
/// restarted receiver can reclaim the fixed port immediately.
fn bind_reuse(port: u16) -> io::Result<TcpListener> {
    // SAFETY: plain socket syscalls; the fd is either closed on every
    // error path or handed to TcpListener, which owns it from then on.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(one).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(Ipv4Addr::LOCALHOST).to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            std::ptr::addr_of!(addr).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        if libc::listen(fd, 1) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}

/// Consumer half of the TCP transport.
pub struct TcpConsumer {
    listener: TcpListener,
    port: u16,
}

impl TcpConsumer {
    /// Binds the loopback listener. Port 0 asks the kernel for an
    /// ephemeral port, which tests use.
    pub fn bind(port: u16) -> Result<Self> {
        let listener = bind_reuse(port)?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        info!("listening on 127.0.0.1:{port}");
        Ok(TcpConsumer { listener, port })
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Waits for a producer to connect, polling so `exiting` is observed
    /// within one tick. `None` means shutdown was requested.
    pub fn accept(&self, exiting: &AtomicBool) -> Result<Option<TcpStream>> {
        loop {
            if exiting.load(Ordering::Relaxed) {
                return Ok(None);
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(POLL_TIMEOUT))?;
                    info!("producer connected from {peer}");
                    return Ok(Some(stream));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(POLL_TIMEOUT);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drives one producer session: reads the init header, then frames
    /// until the peer goes away, a protocol violation occurs, or
    /// `exiting` is observed (returns `Ok` in that case).
    pub fn serve_connection(
        &self,
        stream: &mut TcpStream,
        exiting: &AtomicBool,
        handler: &mut dyn FrameHandler,
    ) -> Result<()> {
        let mut init_buf = vec![0u8; INIT_HEADER_BYTES];
        if !read_full(stream, &mut init_buf, exiting)? {
            return Ok(());
        }
        let init = InitHeader::decode(&init_buf)?;
        validate_init(&init)?;
        info!(
            "stream init: {}x{} format_tag={} num_images={} source_pid={}",
            init.width, init.height, init.format_tag, init.num_images, init.source_pid
        );
        handler.on_stream_start(&StreamConfig {
            width: init.width,
            height: init.height,
            format_tag: init.format_tag,
        })?;

        let mut header_buf = vec![0u8; FRAME_HEADER_BYTES];
        let mut payload = Vec::new();
        loop {
            if !read_full(stream, &mut header_buf, exiting)? {
                return Ok(());
            }
            let header = FrameHeader::decode(&header_buf)?;
            validate_frame_header(&header)?;

            payload.resize(header.data_size as usize, 0);
            if !read_full(stream, &mut payload, exiting)? {
                return Ok(());
            }

            debug!(
                "frame {} received ({} bytes)",
                header.frame_number, header.data_size
            );
            let frame = Frame {
                frame_number: u64::from(header.frame_number),
                image_index: header.image_index,
                width: header.width,
                height: header.height,
                stride: header.stride,
                is_idr: header.is_idr,
                // Opaque on the wire; this receiver's policy reads it as
                // the target timestamp in nanoseconds.
                target_timestamp_ns: header.semaphore_value,
                pose: header.pose,
                pixels: &payload,
            };
            handler.on_frame(&frame)?;
        }
    }
}

fn validate_init(init: &InitHeader) -> Result<()> {
    if init.width == 0 || init.height == 0 || init.width > MAX_WIDTH || init.height > MAX_HEIGHT {
        return Err(LinkError::Protocol(format!(
            "impossible init geometry {}x{}",
            init.width, init.height
        )));
    }
    if init.num_images == 0 {
        return Err(LinkError::Protocol("init with zero images".into()));
    }
    Ok(())
}

fn validate_frame_header(header: &FrameHeader) -> Result<()> {
    if header.width == 0
        || header.height == 0
        || header.width > MAX_WIDTH
        || header.height > MAX_HEIGHT
    {
        return Err(LinkError::Protocol(format!(
            "impossible frame geometry {}x{}",
            header.width, header.height
        )));
    }
    if header.stride < header.width * 4 {
        return Err(LinkError::Protocol(format!(
            "stride {} below row size {}",
            header.stride,
            header.width * 4
        )));
    }
    let expected = header.height as u64 * u64::from(header.stride);
    if u64::from(header.data_size) != expected || header.data_size as usize > MAX_DATA_SIZE {
        return Err(LinkError::Protocol(format!(
            "data_size {} does not match {}x{} stride {}",
            header.data_size, header.width, header.height, header.stride
        )));
    }
    Ok(())
}

/// Fills `buf` completely, tolerating short reads and poll timeouts.
/// Returns `Ok(false)` when `exiting` was observed mid-read, and
/// `PeerGone` on EOF or a hard socket error.
fn read_full(stream: &mut TcpStream, buf: &mut [u8], exiting: &AtomicBool) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        if exiting.load(Ordering::Relaxed) {
            return Ok(false);
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(LinkError::PeerGone("connection closed".into())),
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(LinkError::PeerGone(format!("read failed: {e}"))),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(width: u32, height: u32, stride: u32, data_size: u32) -> FrameHeader {
        FrameHeader {
            image_index: 0,
            frame_number: 0,
            semaphore_value: 0,
            pose: framelink_protocol::frame::POSE_IDENTITY,
            width,
            height,
            stride,
            is_idr: false,
            data_size,
        }
    }

    #[test]
    fn frame_header_validation() {
        assert!(validate_frame_header(&header(64, 32, 256, 8192)).is_ok());
        // Padded stride is tolerated when data_size agrees.
        assert!(validate_frame_header(&header(64, 32, 320, 10240)).is_ok());

        assert!(validate_frame_header(&header(0, 32, 256, 8192)).is_err());
        assert!(validate_frame_header(&header(64, 32, 128, 4096)).is_err());
        assert!(validate_frame_header(&header(64, 32, 256, 8191)).is_err());
        assert!(validate_frame_header(&header(MAX_WIDTH + 1, 32, (MAX_WIDTH + 1) * 4, 0)).is_err());
    }

    #[test]
    fn init_validation() {
        let good = InitHeader {
            num_images: 3,
            device_uuid: [0; 16],
            width: 1920,
            height: 1080,
            format_tag: 87,
            mem_index: 0,
            source_pid: 1,
        };
        assert!(validate_init(&good).is_ok());

        let mut bad = good.clone();
        bad.width = 0;
        assert!(validate_init(&bad).is_err());

        let mut bad = good.clone();
        bad.num_images = 0;
        assert!(validate_init(&bad).is_err());
    }

    #[test]
    fn ephemeral_bind_reports_port() {
        let consumer = TcpConsumer::bind(0).unwrap();
        assert_ne!(consumer.port(), 0);
    }
}

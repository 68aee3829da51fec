// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! TCP producer.
//!
//! One long-lived loopback connection. The producer sends exactly one
//! `InitHeader`, then `FrameHeader + pixels` per frame, in order.
//! Backpressure is the kernel send buffer; a send that fails or outlives
//! the write deadline tears the connection down, and subsequent frames
//! are dropped silently until a reconnect attempt succeeds on a later
//! submit.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use framelink_protocol::wire::{FrameHeader, InitHeader};
use framelink_protocol::{Frame, Result};

use crate::SubmitOutcome;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);
const SEND_DEADLINE: Duration = Duration::from_millis(250);
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Producer half of the TCP transport.
pub struct TcpProducer {
    port: u16,
    init: InitHeader,
    stream: Option<TcpStream>,
    scratch: Vec<u8>,
    connects: u64,
    frames_sent: u64,
    frames_dropped: u64,
    drops_since_log: u64,
    last_drop_log: Option<Instant>,
}

impl TcpProducer {
    /// Creates a producer for `127.0.0.1:port`. No connection is made
    /// until [`connect`](Self::connect) or the first submit.
    pub fn new(port: u16, init: InitHeader) -> Self {
        TcpProducer {
            port,
            init,
            stream: None,
            scratch: Vec::new(),
            connects: 0,
            frames_sent: 0,
            frames_dropped: 0,
            drops_since_log: 0,
            last_drop_log: None,
        }
    }

    /// Whether a connection is currently up.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Frames successfully written to the socket.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Frames dropped while disconnected or on failed sends.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Dials the receiver and sends the init header.
    pub fn connect(&mut self) -> Result<()> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port));
        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(SEND_DEADLINE))?;

        self.scratch.clear();
        self.init.encode_into(&mut self.scratch);
        stream.write_all(&self.scratch)?;

        self.connects += 1;
        self.stream = Some(stream);
        info!("connected to receiver on port {}", self.port);
        Ok(())
    }

    /// Sends one frame, reconnecting first if the link is down. A failed
    /// send tears the connection down and counts the frame as dropped;
    /// the next submit retries the connect.
    pub fn submit(&mut self, frame: &Frame) -> Result<SubmitOutcome> {
        frame.validate()?;

        if self.stream.is_none() {
            if let Err(e) = self.connect() {
                self.note_drop(&format!("receiver unreachable: {e}"));
                return Ok(SubmitOutcome::Dropped);
            }
        }

        let header = FrameHeader {
            image_index: frame.image_index,
            frame_number: frame.frame_number as u32,
            // Opaque on the wire; this producer carries the target
            // timestamp through it.
            semaphore_value: frame.target_timestamp_ns,
            pose: frame.pose,
            width: frame.width,
            height: frame.height,
            stride: frame.stride,
            is_idr: frame.is_idr,
            data_size: frame.pixels.len() as u32,
        };
        self.scratch.clear();
        header.encode_into(&mut self.scratch);

        let result = match self.stream.as_mut() {
            Some(stream) => stream
                .write_all(&self.scratch)
                .and_then(|()| stream.write_all(frame.pixels)),
            None => return Ok(SubmitOutcome::Dropped),
        };

        match result {
            Ok(()) => {
                self.frames_sent += 1;
                debug!("sent frame {} ({} bytes)", frame.frame_number, frame.pixels.len());
                Ok(SubmitOutcome::Published)
            }
            Err(e) => {
                self.stream = None;
                self.note_drop(&format!("send failed: {e}"));
                Ok(SubmitOutcome::Dropped)
            }
        }
    }

    /// Closes the connection. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stream.take().is_some() {
            info!(
                "tcp producer stopping, sent {} dropped {} over {} connection(s)",
                self.frames_sent, self.frames_dropped, self.connects
            );
        }
    }

    fn note_drop(&mut self, reason: &str) {
        self.frames_dropped += 1;
        self.drops_since_log += 1;
        let now = Instant::now();
        let due = self
            .last_drop_log
            .map_or(true, |last| now.duration_since(last) >= DROP_LOG_INTERVAL);
        if due {
            warn!("dropped {} frame(s): {reason}", self.drops_since_log);
            self.drops_since_log = 0;
            self.last_drop_log = Some(now);
        }
    }
}

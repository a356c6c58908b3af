//! I/O driver for one [`Channel`](super::Channel).
//!
//! The slot attaches a fresh runner to every (re)connected socket. The
//! runner owns the reader and writer halves and runs three loops: frame
//! reception, eligible-entry transmission and deadline bookkeeping.
//! Whichever half fails first wins the race and the error is handed
//! back to the slot, which releases all pending requests and schedules
//! a reconnect.

use core::future::poll_fn;

use embassy_futures::select::{select3, Either3};
use embassy_time::Timer;
use embedded_io_async::{Read, Write};

use crate::ril::frame::{self, FrameError, Packet, MAX_FRAME};
use crate::ril::{request_name, unsol_name};

use super::{Channel, LogRecord, PacketDir};

#[derive(Debug)]
pub enum RunnerError {
    /// The socket read side failed or reached end-of-stream.
    Read,
    /// The socket write side failed.
    Write,
    /// The peer sent a frame larger than [`MAX_FRAME`].
    FrameTooLong(usize),
}

pub struct Runner<'a, R, W> {
    chan: &'a Channel,
    rx: R,
    tx: W,
    sub: Option<&'a str>,
}

impl<'a, R: Read, W: Write> Runner<'a, R, W> {
    pub fn new(chan: &'a Channel, rx: R, tx: W) -> Self {
        Self {
            chan,
            rx,
            tx,
            sub: None,
        }
    }

    /// Arranges for the multi-SIM subscription selector to be written
    /// once, before any request.
    pub fn with_subscription(mut self, sub: &'a str) -> Self {
        self.sub = Some(sub);
        self
    }

    /// Drives the socket until an I/O error. Does not release pending
    /// requests itself; the caller does that via
    /// [`Channel::fail_all`] once it decides the connection is gone.
    pub async fn run(mut self) -> RunnerError {
        if let Some(sub) = self.sub {
            debug!("sending subscription {}", sub);
            if frame::write_frame(&mut self.tx, &[sub.as_bytes()])
                .await
                .is_err()
            {
                return RunnerError::Write;
            }
        }

        let chan = self.chan;
        match select3(
            rx_loop(chan, &mut self.rx),
            tx_loop(chan, &mut self.tx),
            deadline_loop(chan),
        )
        .await
        {
            Either3::First(e) => e,
            Either3::Second(e) => e,
            Either3::Third(never) => match never {},
        }
    }
}

async fn rx_loop<R: Read>(chan: &Channel, rx: &mut R) -> RunnerError {
    let mut buf = [0u8; MAX_FRAME];
    loop {
        let payload = match frame::read_frame(rx, &mut buf).await {
            Ok(payload) => payload,
            Err(FrameError::TooLong(n)) => return RunnerError::FrameTooLong(n),
            Err(_) => return RunnerError::Read,
        };
        match frame::parse(payload) {
            Some(Packet::Response {
                serial,
                status,
                data,
            }) => chan.handle_response(serial, status, data),
            Some(Packet::Unsol { code, data }) => chan.handle_unsol(code, data),
            None => {
                // A parse error fails nothing but this packet.
                warn!("unparseable frame, {} bytes", payload.len());
            }
        }
    }
}

async fn tx_loop<W: Write>(chan: &Channel, tx: &mut W) -> RunnerError {
    loop {
        let (serial, code, body) = poll_fn(|cx| chan.poll_next_tx(cx)).await;
        trace!("sending {} serial {}", request_name(code), serial);
        let header = frame::request_header(code, serial);
        if frame::write_frame(tx, &[&header, &body]).await.is_err() {
            return RunnerError::Write;
        }
    }
}

async fn deadline_loop(chan: &Channel) -> core::convert::Infallible {
    loop {
        let seen = chan.epoch();
        match chan.next_deadline() {
            None => {
                // Nothing armed; sleep until the bookkeeping changes.
                poll_fn(|cx| chan.poll_epoch_change(seen, cx)).await;
            }
            Some(at) => {
                let timer = Timer::at(at);
                let changed = poll_fn(|cx| chan.poll_epoch_change(seen, cx));
                match embassy_futures::select::select(timer, changed).await {
                    embassy_futures::select::Either::First(()) => {
                        chan.process_deadlines(embassy_time::Instant::now());
                    }
                    embassy_futures::select::Either::Second(_) => {}
                }
            }
        }
    }
}

/// Stock wire tracer in the shape the channel logger registry expects.
/// Slots install it when packet tracing is wanted.
pub fn trace_logger(record: &LogRecord<'_>) {
    match record.dir {
        PacketDir::Req => {
            trace!(
                "< [{}] {} ({} bytes)",
                record.serial,
                request_name(record.code),
                record.data.len()
            );
        }
        PacketDir::Resp => {
            trace!(
                "> [{}] status {} ({} bytes)",
                record.serial,
                record.status,
                record.data.len()
            );
        }
        PacketDir::Unsol => {
            trace!("> {} ({} bytes)", unsol_name(record.code), record.data.len());
        }
    }
}

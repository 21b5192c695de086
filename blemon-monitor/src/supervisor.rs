//! Link supervisors: keep the data and GPS streams alive across disconnects.
//!
//! Each supervisor is one task: open, read lines until the stream ends or
//! fails, back off, reopen. Every wait observes the shared cancellation token,
//! and the open link is dropped (closing the port) before the task returns.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use blemon_core::nmea::{self, NmeaInterpreter};
use blemon_core::{ConnectionState, GpsStatus, LineOutcome, LocationState, RecordHandler, RetryDelay};

use crate::alert::{Alert, AlertSender};
use crate::link::{LinkOpener, LinkReader, NoDevice};

/// Candidate GPS baud rates, most common first.
pub const GPS_BAUD_RATES: [u32; 4] = [9600, 115_200, 38_400, 4800];

/// How long to listen at each candidate rate.
pub const GPS_DETECT_WINDOW: Duration = Duration::from_secs(2);

/// Full passes over [`GPS_BAUD_RATES`] before giving up.
pub const GPS_DETECT_PASSES: usize = 3;

/// Valid sentences needed to accept a rate.
pub const GPS_VALID_SENTENCES: usize = 2;

/// Longest scanner record accepted before the link is treated as failed.
pub const MAX_RECORD_LINE: usize = 1024 * 1024;

/// Longest NMEA line accepted before the link is treated as failed.
pub const MAX_NMEA_LINE: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// Line reading
// ---------------------------------------------------------------------------

/// Why a read loop stopped.
#[derive(Debug)]
enum ReadEnd {
    Cancelled,
    Eof,
    Failed(io::Error),
}

/// Read one line into `buf`. Fails with `InvalidData` once more than
/// `max_line` bytes arrive without a newline.
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, max_line: usize) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(max_line).unwrap_or(u64::MAX).saturating_add(1);
    let n = AsyncReadExt::take(&mut *reader, limit)
        .read_until(b'\n', buf)
        .await?;
    if n > max_line && buf.last() != Some(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line longer than {max_line} bytes"),
        ));
    }
    Ok(n)
}

/// Feed every newline-terminated line of `reader` to `on_line` until the
/// stream ends, fails, or shutdown is signalled.
async fn read_lines<F>(
    reader: LinkReader,
    max_line: usize,
    cancel: &CancellationToken,
    mut on_line: F,
) -> ReadEnd
where
    F: FnMut(&[u8]),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(512);
    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ReadEnd::Cancelled,
            r = read_line_capped(&mut reader, &mut buf, max_line) => r,
        };
        match read {
            Ok(0) => return ReadEnd::Eof,
            Ok(_) => on_line(&buf),
            Err(e) => return ReadEnd::Failed(e),
        }
    }
}

/// Sleep for `delay` unless shutdown comes first. Returns false on shutdown.
async fn wait_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

// ---------------------------------------------------------------------------
// Data link
// ---------------------------------------------------------------------------

/// Supervises the scanner's record stream.
pub struct DataLinkSupervisor<O: LinkOpener> {
    opener: O,
    baud: u32,
    handler: Arc<RecordHandler>,
    connection: Arc<ConnectionState>,
    alerts: AlertSender,
    cancel: CancellationToken,
    retry: RetryDelay,
}

impl<O: LinkOpener + 'static> DataLinkSupervisor<O> {
    pub fn new(
        opener: O,
        baud: u32,
        handler: Arc<RecordHandler>,
        connection: Arc<ConnectionState>,
        alerts: AlertSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            opener,
            baud,
            handler,
            connection,
            alerts,
            cancel,
            retry: RetryDelay::default(),
        }
    }

    /// Start the supervisor as an async task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Reconnect loop. Runs until shutdown.
    pub async fn run(mut self) {
        let link = self.opener.describe();
        tracing::info!(link = %link, baud = self.baud, "Data link supervisor started");

        loop {
            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = self.opener.open(self.baud) => r,
            };

            let delay = match opened {
                Ok(reader) => {
                    self.connection.set_connected();
                    self.retry.reset();
                    let _ = self.alerts.send(Alert::Connected);
                    tracing::info!(link = %link, "Data link connected");

                    match self.read(reader).await {
                        ReadEnd::Cancelled => break,
                        ReadEnd::Eof => tracing::warn!(link = %link, "Data link closed"),
                        ReadEnd::Failed(e) => {
                            tracing::warn!(link = %link, error = %e, "Data link read failed")
                        }
                    }

                    self.connection.set_disconnected();
                    self.connection.record_failure();
                    let _ = self.alerts.send(Alert::LinkLost);
                    self.retry.current()
                }
                Err(e) => {
                    self.connection.set_disconnected();
                    self.connection.record_failure();
                    let attempt = self.connection.status().failed_attempts;
                    let _ = self.alerts.send(Alert::ReconnectAttempt { attempt });
                    tracing::warn!(
                        link = %link,
                        error = %e,
                        attempt,
                        next_retry_secs = self.retry.current().as_secs(),
                        "Data link open failed"
                    );
                    self.retry.after_failure()
                }
            };

            if !wait_or_cancel(delay, &self.cancel).await {
                break;
            }
        }

        tracing::info!(link = %link, "Data link supervisor stopped");
    }

    async fn read(&self, reader: LinkReader) -> ReadEnd {
        let handler = &self.handler;
        let alerts = &self.alerts;
        read_lines(reader, MAX_RECORD_LINE, &self.cancel, |line| match handler.handle_line(line) {
            LineOutcome::Notification(text) => {
                let _ = alerts.send(Alert::Notification(text));
            }
            LineOutcome::Malformed => tracing::trace!(len = line.len(), "Dropped malformed record"),
            LineOutcome::Paused | LineOutcome::Sighting { .. } => {}
        })
        .await
    }
}

impl DataLinkSupervisor<NoDevice> {
    /// Supervisor for a stream that is never reopened (standard input).
    pub fn fixed(
        handler: Arc<RecordHandler>,
        connection: Arc<ConnectionState>,
        alerts: AlertSender,
        cancel: CancellationToken,
    ) -> Self {
        Self::new(NoDevice, 0, handler, connection, alerts, cancel)
    }

    /// Read `reader` to the end. The link counts as connected for its whole
    /// lifetime and is never retried.
    pub async fn run_fixed(self, reader: LinkReader) {
        self.connection.set_connected();
        tracing::info!("Reading records from standard input");
        match self.read(reader).await {
            ReadEnd::Cancelled => {}
            ReadEnd::Eof => tracing::info!("Standard input closed"),
            ReadEnd::Failed(e) => tracing::warn!(error = %e, "Standard input read failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// GPS link
// ---------------------------------------------------------------------------

/// Count valid NMEA sentences at one baud rate, up to `needed`, within `window`.
async fn count_valid_sentences(
    reader: LinkReader,
    window: Duration,
    needed: usize,
    cancel: &CancellationToken,
) -> usize {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    let mut valid = 0;

    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    while valid < needed {
        buf.clear();
        tokio::select! {
            _ = &mut deadline => break,
            _ = cancel.cancelled() => break,
            r = read_line_capped(&mut reader, &mut buf, MAX_NMEA_LINE) => match r {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if nmea::parse_sentence(&String::from_utf8_lossy(&buf)).is_some() {
                        valid += 1;
                    }
                }
            },
        }
    }
    valid
}

/// Try each candidate rate in turn, for several passes. `None` if no rate
/// produced enough valid sentences or shutdown was signalled.
pub async fn detect_baud<O: LinkOpener>(opener: &O, cancel: &CancellationToken) -> Option<u32> {
    for pass in 1..=GPS_DETECT_PASSES {
        for baud in GPS_BAUD_RATES {
            if cancel.is_cancelled() {
                return None;
            }
            let reader = match opener.open(baud).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(pass, baud, error = %e, "GPS open failed during detection");
                    continue;
                }
            };
            let valid =
                count_valid_sentences(reader, GPS_DETECT_WINDOW, GPS_VALID_SENTENCES, cancel).await;
            tracing::debug!(pass, baud, valid, "GPS baud probe");
            if valid >= GPS_VALID_SENTENCES {
                return Some(baud);
            }
        }
    }
    None
}

/// Supervises the GPS receiver: baud negotiation once, then a reconnect loop
/// at the negotiated rate.
pub struct GpsSupervisor<O: LinkOpener> {
    opener: O,
    location: Arc<LocationState>,
    cancel: CancellationToken,
    retry: RetryDelay,
}

impl<O: LinkOpener + 'static> GpsSupervisor<O> {
    pub fn new(opener: O, location: Arc<LocationState>, cancel: CancellationToken) -> Self {
        Self {
            opener,
            location,
            cancel,
            retry: RetryDelay::default(),
        }
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    pub async fn run(mut self) {
        let link = self.opener.describe();
        self.location.set_status(GpsStatus::Detecting);
        tracing::info!(link = %link, "Detecting GPS baud rate");

        let Some(baud) = detect_baud(&self.opener, &self.cancel).await else {
            if !self.cancel.is_cancelled() {
                self.location.set_status(GpsStatus::Failed);
                tracing::error!(
                    link = %link,
                    rates = ?GPS_BAUD_RATES,
                    "No valid NMEA at any baud rate, GPS disabled"
                );
            }
            return;
        };
        tracing::info!(link = %link, baud, "GPS baud rate detected");

        loop {
            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = self.opener.open(baud) => r,
            };

            let delay = match opened {
                Ok(reader) => {
                    self.location.set_link_connected(true);
                    self.location.set_status(GpsStatus::NoFix);
                    self.retry.reset();
                    tracing::info!(link = %link, baud, "GPS connected");

                    let location = &self.location;
                    let mut interpreter = NmeaInterpreter::new();
                    let end = read_lines(reader, MAX_NMEA_LINE, &self.cancel, |line| {
                        interpreter.apply(&String::from_utf8_lossy(line), location);
                    })
                    .await;

                    match end {
                        ReadEnd::Cancelled => break,
                        ReadEnd::Eof => tracing::warn!(link = %link, "GPS link closed"),
                        ReadEnd::Failed(e) => {
                            tracing::warn!(link = %link, error = %e, "GPS read failed")
                        }
                    }
                    self.location.set_link_connected(false);
                    self.location.set_status(GpsStatus::NoFix);
                    self.retry.current()
                }
                Err(e) => {
                    self.location.set_link_connected(false);
                    self.location.record_reconnect_attempt();
                    self.location.set_status(GpsStatus::NoFix);
                    tracing::warn!(
                        link = %link,
                        error = %e,
                        attempts = self.location.snapshot().reconnect_attempts,
                        "GPS open failed"
                    );
                    self.retry.after_failure()
                }
            };

            if !wait_or_cancel(delay, &self.cancel).await {
                break;
            }
        }

        tracing::info!(link = %link, "GPS supervisor stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

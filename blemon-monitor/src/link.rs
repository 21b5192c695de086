//! Byte-stream links: serial ports in production, scripted streams in tests.

use std::io;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_serial::SerialPortBuilderExt;

/// An open link, read line by line by the supervisors.
pub type LinkReader = Box<dyn AsyncRead + Send + Unpin>;

/// Opens a link at a given baud rate. Each call is one connection attempt.
#[async_trait]
pub trait LinkOpener: Send + Sync {
    async fn open(&self, baud: u32) -> io::Result<LinkReader>;

    /// Human-readable name for logs.
    fn describe(&self) -> String;
}

/// A serial device, 8N1.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    path: String,
}

impl SerialOpener {
    pub fn new(path: &str) -> Self {
        SerialOpener {
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl LinkOpener for SerialOpener {
    async fn open(&self, baud: u32) -> io::Result<LinkReader> {
        let port = tokio_serial::new(&self.path, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(io::Error::from)?;
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// Stands in for a port when records arrive on a stream that is never
/// reopened. Opening it always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDevice;

#[async_trait]
impl LinkOpener for NoDevice {
    async fn open(&self, _baud: u32) -> io::Result<LinkReader> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no device configured",
        ))
    }

    fn describe(&self) -> String {
        "stdin".into()
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted opener for supervisor tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::*;

    /// Result of one scripted `open` call.
    pub enum Step {
        Fail,
        /// Opens and yields these bytes, then end of stream.
        Data(Vec<u8>),
    }

    /// Plays back `steps` in order. Once the script runs out, the next open
    /// fails and cancels `cancel`, ending the supervisor under test.
    pub struct ScriptedOpener {
        steps: Mutex<VecDeque<Step>>,
        cancel: CancellationToken,
        pub calls: Mutex<Vec<(Instant, u32)>>,
    }

    impl ScriptedOpener {
        pub fn new(steps: Vec<Step>, cancel: CancellationToken) -> Self {
            ScriptedOpener {
                steps: Mutex::new(steps.into()),
                cancel,
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Seconds since the first call, and the baud, for each call.
        pub fn call_log(&self) -> Vec<(u64, u32)> {
            let calls = self.calls.lock().unwrap();
            let Some(&(start, _)) = calls.first() else {
                return Vec::new();
            };
            calls
                .iter()
                .map(|&(at, baud)| ((at - start).as_secs(), baud))
                .collect()
        }
    }

    #[async_trait]
    impl LinkOpener for ScriptedOpener {
        async fn open(&self, baud: u32) -> io::Result<LinkReader> {
            self.calls.lock().unwrap().push((Instant::now(), baud));
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Data(bytes)) => Ok(Box::new(io::Cursor::new(bytes))),
                Some(Step::Fail) => Err(io::Error::new(io::ErrorKind::NotFound, "no device")),
                None => {
                    self.cancel.cancel();
                    Err(io::Error::new(io::ErrorKind::NotFound, "script finished"))
                }
            }
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }
}

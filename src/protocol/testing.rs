//! In-memory channels for exercising the protocol without sockets.
use std::{
    io::{self, Cursor, Read, Write},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::codec::Value;

use super::{Channel, Closer, FrameTransport, WireObject};

/// Replays canned peer bytes, records what is written, and reports a read
/// timeout once the script runs dry.
#[derive(Debug, Clone)]
pub(crate) struct ScriptedChannel {
    input: Arc<Mutex<Cursor<Vec<u8>>>>,
    pub(crate) written: Arc<Mutex<Vec<u8>>>,
    pub(crate) read_timeout: Arc<Mutex<Option<Duration>>>,
    pub(crate) closed: Arc<AtomicBool>,
}

impl ScriptedChannel {
    pub(crate) fn new(input: Vec<u8>) -> Self {
        Self {
            input: Arc::new(Mutex::new(Cursor::new(input))),
            written: Arc::default(),
            read_timeout: Arc::default(),
            closed: Arc::default(),
        }
    }

    /// A channel whose peer replies with the given messages, in order.
    pub(crate) fn replying<M: WireObject>(messages: &[M]) -> Self {
        let values: Vec<Value> = messages.iter().map(WireObject::to_value).collect();
        Self::new(frames(&values))
    }
}

/// Bytes of the given values written as consecutive frames.
pub(crate) fn frames(values: &[Value]) -> Vec<u8> {
    let mut transport = FrameTransport::new(Cursor::new(Vec::new()));
    for value in values {
        transport.write_object(value).unwrap();
    }
    transport.get_ref().get_ref().clone()
}

impl Read for ScriptedChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let n = self.input.lock().unwrap().read(buf)?;
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "script exhausted"));
        }
        Ok(n)
    }
}

impl Write for ScriptedChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Channel for ScriptedChannel {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        *self.read_timeout.lock().unwrap() = timeout;
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn closer(&self) -> io::Result<Arc<dyn Closer>> {
        Ok(self.closed.clone())
    }
}

/// A flag standing in for a socket; closing it sets it.
impl Closer for AtomicBool {
    fn close(&self) -> io::Result<()> {
        self.store(true, Ordering::SeqCst);
        Ok(())
    }
}

//! Connection channel
//!
//! The server talks to its peer through a [`DuplexConnection`]: an ordered,
//! frame-oriented duplex channel. [`IoConnection`] implements it over any
//! byte stream using the length-prefixed framing of the codec.

use crate::codec::FrameCodec;
use crate::error::{Error, Result};
use crate::frames::Frame;
use crate::{StreamId, MAX_FRAME_LENGTH};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Ordered duplex frame channel
pub trait DuplexConnection: Send + Sync + 'static {
    /// Queue a frame for sending
    ///
    /// Callable from any thread. Must not block on the peer and must not call
    /// back into the server before returning. Frames queued by one thread are
    /// sent in order.
    fn send(&self, frame: Frame) -> Result<()>;

    /// Wait for the next inbound frame
    ///
    /// Returns `Ok(None)` once the peer closed the connection cleanly.
    fn receive(&self) -> Result<Option<Frame>>;

    /// Close the connection; queued frames are still flushed
    fn close(&self);
}

/// Called with the stream id of every NEXT frame written to the transport
pub type DrainListener = Arc<dyn Fn(StreamId) + Send + Sync>;

/// Duplex connection over a byte-stream reader and writer
///
/// Outbound frames go through a queue to a dedicated writer thread, so `send`
/// never waits for the socket. The drain listener reports written NEXT frames,
/// which is how send capacity flows back into the server's windows.
pub struct IoConnection<R> {
    reader: Mutex<R>,
    max_frame_length: usize,
    outbound: Mutex<Option<Sender<Frame>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    write_error: Arc<Mutex<Option<(io::ErrorKind, String)>>>,
    drain_listener: Arc<Mutex<Option<DrainListener>>>,
    closed: AtomicBool,
}

impl<R: Read + Send + 'static> IoConnection<R> {
    /// Create a connection and start its writer thread
    pub fn new<W: Write + Send + 'static>(reader: R, writer: W) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let write_error = Arc::new(Mutex::new(None));
        let drain_listener: Arc<Mutex<Option<DrainListener>>> = Arc::new(Mutex::new(None));

        let handle = {
            let write_error = write_error.clone();
            let drain_listener = drain_listener.clone();
            thread::Builder::new()
                .name("rsocket-writer".to_string())
                .spawn(move || write_loop(writer, rx, write_error, drain_listener))?
        };

        Ok(IoConnection {
            reader: Mutex::new(reader),
            max_frame_length: MAX_FRAME_LENGTH,
            outbound: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(handle)),
            write_error,
            drain_listener,
            closed: AtomicBool::new(false),
        })
    }

    /// Limit the size of accepted frames
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length.min(MAX_FRAME_LENGTH);
        self
    }

    /// Install the listener for written NEXT frames
    pub fn set_drain_listener<F>(&self, listener: F)
    where
        F: Fn(StreamId) + Send + Sync + 'static,
    {
        *self.drain_listener.lock() = Some(Arc::new(listener));
    }

    /// Check if `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<R> IoConnection<R> {
    fn latched_error(&self) -> Option<Error> {
        self.write_error
            .lock()
            .as_ref()
            .map(|(kind, message)| Error::Io(io::Error::new(*kind, message.clone())))
    }
}

fn write_loop<W: Write>(
    mut writer: W,
    rx: Receiver<Frame>,
    write_error: Arc<Mutex<Option<(io::ErrorKind, String)>>>,
    drain_listener: Arc<Mutex<Option<DrainListener>>>,
) {
    let mut codec = FrameCodec::new();

    for frame in rx {
        let stream_id = frame.stream_id();
        let is_next = frame.is_next();
        let bytes = match codec.encode_length_prefixed(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, frame = %frame, "Encode failed");
                *write_error.lock() = Some((io::ErrorKind::InvalidData, e.to_string()));
                return;
            }
        };

        if let Err(e) = FrameCodec::write_frame(&mut writer, &bytes) {
            tracing::warn!(error = %e, frame = %frame, "Write failed");
            *write_error.lock() = Some((e.kind(), e.to_string()));
            return;
        }
        tracing::trace!(frame = %frame, "Frame written");

        if is_next {
            let listener = drain_listener.lock().clone();
            if let Some(listener) = listener {
                listener(stream_id);
            }
        }
    }
}

impl<R: Read + Send + 'static> DuplexConnection for IoConnection<R> {
    fn send(&self, frame: Frame) -> Result<()> {
        if let Some(error) = self.latched_error() {
            return Err(error);
        }

        match self.outbound.lock().as_ref() {
            // The writer only hangs up after a failed write or on close
            Some(tx) => tx
                .send(frame)
                .map_err(|_| self.latched_error().unwrap_or(Error::ConnectionClosed)),
            None => Err(Error::ConnectionClosed),
        }
    }

    fn receive(&self) -> Result<Option<Frame>> {
        let mut reader = self.reader.lock();
        match FrameCodec::read_frame(&mut *reader, self.max_frame_length)? {
            Some(bytes) => FrameCodec::decode(bytes).map(Some),
            None => Ok(None),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender lets the writer flush the queue and exit
        self.outbound.lock().take();
        tracing::debug!("Connection closed");
    }
}

impl<R> Drop for IoConnection<R> {
    fn drop(&mut self) {
        self.outbound.lock().take();
        if let Some(handle) = self.writer.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{KeepaliveFrame, PayloadFrame, RequestNFrame};
    use crate::payload::Payload;
    use bytes::Bytes;
    use std::io::Cursor;

    /// Writer that appends to a shared buffer
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_frames_written_in_order_and_drained() {
        let buffer = SharedBuffer::default();
        let drained = Arc::new(Mutex::new(Vec::new()));
        let connection = IoConnection::new(Cursor::new(Vec::new()), buffer.clone()).unwrap();
        {
            let drained = drained.clone();
            connection.set_drain_listener(move |id| drained.lock().push(id));
        }

        connection
            .send(Frame::Payload(PayloadFrame::next(1, Payload::from_data("a"))))
            .unwrap();
        connection.send(Frame::RequestN(RequestNFrame::new(3, 5))).unwrap();
        connection
            .send(Frame::Payload(PayloadFrame::next(3, Payload::from_data("b"))))
            .unwrap();
        connection.close();
        drop(connection);

        // Only NEXT frames are reported
        assert_eq!(*drained.lock(), vec![1, 3]);

        let written = buffer.0.lock().clone();
        let mut reader = Cursor::new(written);
        let mut frames = Vec::new();
        while let Some(bytes) = FrameCodec::read_frame(&mut reader, MAX_FRAME_LENGTH).unwrap() {
            frames.push(FrameCodec::decode(bytes).unwrap());
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1], Frame::RequestN(RequestNFrame::new(3, 5)));
    }

    #[test]
    fn test_receive_decodes_until_eof() {
        let mut codec = FrameCodec::new();
        let mut input = Vec::new();
        let keepalive = Frame::Keepalive(KeepaliveFrame::new(true, Bytes::from_static(b"ping")));
        input.extend_from_slice(&codec.encode_length_prefixed(&keepalive).unwrap());

        let connection = IoConnection::new(Cursor::new(input), io::sink()).unwrap();
        assert_eq!(connection.receive().unwrap(), Some(keepalive));
        assert_eq!(connection.receive().unwrap(), None);
    }

    #[test]
    fn test_send_after_close_fails() {
        let connection = IoConnection::new(Cursor::new(Vec::new()), io::sink()).unwrap();
        connection.close();
        connection.close();
        assert!(connection.is_closed());

        let result = connection.send(Frame::RequestN(RequestNFrame::new(1, 1)));
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_write_failure_is_latched() {
        let connection = IoConnection::new(Cursor::new(Vec::new()), BrokenPipe).unwrap();
        connection.send(Frame::RequestN(RequestNFrame::new(1, 1))).unwrap();

        // The writer thread records the failure asynchronously
        let mut result = Ok(());
        for _ in 0..200 {
            result = connection.send(Frame::RequestN(RequestNFrame::new(1, 1)));
            if result.is_err() {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(matches!(result, Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::BrokenPipe));
    }
}

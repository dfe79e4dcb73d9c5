//! Bounded in-memory byte pipe.
//!
//! The writer pushes chunks through a bounded channel and blocks once the
//! reader falls behind. Failing the writer surfaces the error to the reader
//! after any chunk already in flight, instead of a silent end of stream.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

/// Reading half of a [`pipe`].
pub type PipeReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

#[derive(Default)]
struct Shared {
    error: Mutex<Option<io::Error>>,
}

impl Shared {
    fn take_error(&self) -> Option<io::Error> {
        self.error.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Writing half of a [`pipe`]. Dropping it ends the stream normally.
pub struct PipeWriter {
    tx: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Send one chunk, waiting for room in the pipe.
    pub async fn send(&self, chunk: Bytes) -> io::Result<()> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader is gone"))
    }

    /// Terminate the stream with `err`. Never blocks.
    pub fn fail(self, err: io::Error) {
        if let Ok(mut slot) = self.shared.error.lock() {
            *slot = Some(err);
        }
    }
}

/// Create a pipe holding at most `capacity` chunks in flight.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared::default());

    let chunks = stream::unfold((rx, Arc::clone(&shared)), |(mut rx, shared)| async move {
        match rx.recv().await {
            Some(chunk) => Some((Ok(chunk), (rx, shared))),
            None => shared.take_error().map(|err| (Err(err), (rx, shared))),
        }
    })
    .boxed();

    (PipeWriter { tx, shared }, StreamReader::new(chunks))
}

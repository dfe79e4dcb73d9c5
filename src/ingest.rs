//! Upload ingestion: turns a client body into a data store input while
//! measuring, hashing and sniffing it on the fly.
//!
//! The body is re-chunked into small pieces and relayed through a bounded
//! [`pipe`](crate::pipe), so a whole file is never held in memory. When the
//! size limit is crossed the pipe is failed, which makes the data store see a
//! read error and abort its write.

use std::fmt::Display;
use std::future::Future;
use std::io;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use md5::{Digest, Md5};
use thiserror::Error;

use crate::data::DataReader;
use crate::pipe::{pipe, PipeWriter};

/// Size of the pieces relayed to the data store.
pub const CHUNK_SIZE: usize = 1024;

/// Bytes inspected to detect the content type.
pub const SNIFF_LEN: usize = 512;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const TEXT_MIME_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("file too big (limit is set to {limit} bytes)")]
    TooBig { limit: u64 },
    #[error("unable to read the request body: {0}")]
    Read(String),
    #[error("unable to relay data to the data store: {0}")]
    Relay(io::Error),
}

/// What was learned about a file while it went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    pub size: u64,
    /// Lowercase hex MD5 of the content
    pub md5: String,
    pub mime_type: String,
}

/// Split `source` into a reader for the data store and the future driving it.
///
/// Both halves must be polled concurrently: the reader only yields what the
/// future pushes, and the future waits for the reader to make room.
pub fn ingest<S, E>(
    source: S,
    max_size: u64,
    file_name: &str,
) -> (DataReader, impl Future<Output = Result<Ingested, IngestError>>)
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let (writer, reader) = pipe(1);
    let file_name = file_name.to_string();
    (
        Box::pin(reader),
        pump(source, writer, max_size, file_name),
    )
}

async fn pump<S, E>(
    source: S,
    writer: PipeWriter,
    max_size: u64,
    file_name: String,
) -> Result<Ingested, IngestError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    futures::pin_mut!(source);

    let mut hasher = Md5::new();
    let mut size: u64 = 0;
    let mut head: Vec<u8> = Vec::with_capacity(SNIFF_LEN);

    while let Some(item) = source.next().await {
        let mut chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                let err = IngestError::Read(e.to_string());
                writer.fail(io::Error::new(io::ErrorKind::UnexpectedEof, err.to_string()));
                return Err(err);
            }
        };

        while !chunk.is_empty() {
            let piece = chunk.split_to(chunk.len().min(CHUNK_SIZE));
            size += piece.len() as u64;
            if size > max_size {
                let err = IngestError::TooBig { limit: max_size };
                writer.fail(io::Error::new(io::ErrorKind::InvalidData, err.to_string()));
                return Err(err);
            }

            if head.len() < SNIFF_LEN {
                let take = (SNIFF_LEN - head.len()).min(piece.len());
                head.extend_from_slice(&piece[..take]);
            }
            hasher.update(&piece);
            writer.send(piece).await.map_err(IngestError::Relay)?;
        }
    }
    drop(writer);

    let mime_type = if size == 0 {
        DEFAULT_MIME_TYPE.to_string()
    } else {
        detect_mime_type(&head, &file_name)
    };

    Ok(Ingested {
        size,
        md5: hex::encode(hasher.finalize()),
        mime_type,
    })
}

/// Content type from the leading bytes, falling back on the file name.
pub fn detect_mime_type(head: &[u8], file_name: &str) -> String {
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_string();
    }

    let guess = mime_guess::from_path(file_name).first();
    if looks_like_text(head) {
        return match guess {
            Some(mime) if mime.type_().as_str() == "text" => mime.to_string(),
            _ => TEXT_MIME_TYPE.to_string(),
        };
    }

    guess
        .map(|mime| mime.to_string())
        .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string())
}

/// UTF-8 without control characters. A multi-byte sequence cut by the sniff
/// window still counts as text.
fn looks_like_text(head: &[u8]) -> bool {
    let text = match std::str::from_utf8(head) {
        Ok(text) => text,
        Err(e) if e.error_len().is_none() => {
            // The prefix up to `valid_up_to` is valid UTF-8 by definition.
            match std::str::from_utf8(&head[..e.valid_up_to()]) {
                Ok(text) => text,
                Err(_) => return false,
            }
        }
        Err(_) => return false,
    };
    !text.is_empty()
        && text
            .chars()
            .all(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t' | '\x0c'))
}

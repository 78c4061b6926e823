//! Image data in transit: hashed as downloaded, decompressed as sent to glance

use std::io::{self, Write};

use bytes::Bytes;
use flate2::write::GzDecoder;
use futures::{Stream, StreamExt};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::resources::{ImageCompression, ImageHash, ImageHashAlgorithm};

/// Read size when streaming image data
pub const TRANSFER_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("download hash verification failed. got: {0}")]
    HashMismatch(String),

    #[error("downloading image content: {0}")]
    Download(#[from] reqwest::Error),

    #[error("decompressing image content: {0}")]
    Decompress(#[from] io::Error),

    #[error("glance stopped reading image content")]
    Aborted,
}

/// A running hash in any algorithm glance understands
pub enum ContentHasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl ContentHasher {
    pub fn new(algorithm: ImageHashAlgorithm) -> Self {
        match algorithm {
            ImageHashAlgorithm::Md5 => ContentHasher::Md5(Md5::new()),
            ImageHashAlgorithm::Sha1 => ContentHasher::Sha1(Sha1::new()),
            ImageHashAlgorithm::Sha256 => ContentHasher::Sha256(Sha256::new()),
            ImageHashAlgorithm::Sha512 => ContentHasher::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Md5(h) => h.update(data),
            ContentHasher::Sha1(h) => h.update(data),
            ContentHasher::Sha256(h) => h.update(data),
            ContentHasher::Sha512(h) => h.update(data),
        }
    }

    /// Lowercase hex digest
    pub fn finish(self) -> String {
        match self {
            ContentHasher::Md5(h) => format!("{:x}", h.finalize()),
            ContentHasher::Sha1(h) => format!("{:x}", h.finalize()),
            ContentHasher::Sha256(h) => format!("{:x}", h.finalize()),
            ContentHasher::Sha512(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Hash everything `source` yields
pub async fn hash_stream<S>(source: S, algorithm: ImageHashAlgorithm) -> Result<String, TransferError>
where
    S: Stream<Item = reqwest::Result<Bytes>>,
{
    futures::pin_mut!(source);
    let mut hasher = ContentHasher::new(algorithm);
    while let Some(chunk) = source.next().await {
        hasher.update(&chunk?);
    }
    Ok(hasher.finish())
}

/// Turns downloaded chunks into the chunks glance receives
pub struct ContentTransfer {
    verify: Option<(ContentHasher, String)>,
    decoder: Option<GzDecoder<Vec<u8>>>,
}

impl ContentTransfer {
    pub fn new(hash: Option<&ImageHash>, decompress: Option<ImageCompression>) -> Self {
        Self {
            verify: hash.map(|h| (ContentHasher::new(h.algorithm), h.value.to_lowercase())),
            decoder: decompress.map(|compression| match compression {
                ImageCompression::Gz => GzDecoder::new(Vec::with_capacity(TRANSFER_BUFFER_SIZE)),
            }),
        }
    }

    /// Process one downloaded chunk, returning whatever is ready to send
    pub fn push(&mut self, chunk: Bytes) -> Result<Bytes, TransferError> {
        if let Some((hasher, _)) = &mut self.verify {
            hasher.update(&chunk);
        }
        match &mut self.decoder {
            Some(decoder) => {
                decoder.write_all(&chunk)?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
            None => Ok(chunk),
        }
    }

    /// Flush the decoder and check the hash of everything downloaded
    ///
    /// Glance only receives the final chunk once verification passed.
    pub fn finish(self) -> Result<Bytes, TransferError> {
        let tail = match self.decoder {
            Some(decoder) => Bytes::from(decoder.finish()?),
            None => Bytes::new(),
        };
        if let Some((hasher, expected)) = self.verify {
            let got = hasher.finish();
            if got != expected {
                return Err(TransferError::HashMismatch(got));
            }
        }
        Ok(tail)
    }
}

async fn forward(sink: &mpsc::Sender<io::Result<Bytes>>, data: Bytes) -> Result<(), TransferError> {
    if data.is_empty() {
        return Ok(());
    }
    sink.send(Ok(data)).await.map_err(|_| TransferError::Aborted)
}

/// Feed `source` through `transfer` into `sink`, returning the number of bytes downloaded
///
/// On failure the error is also sent to `sink`, so the upload reading it fails
/// instead of completing with truncated content.
pub async fn pump<S>(source: S, mut transfer: ContentTransfer, sink: mpsc::Sender<io::Result<Bytes>>) -> Result<u64, TransferError>
where
    S: Stream<Item = reqwest::Result<Bytes>>,
{
    futures::pin_mut!(source);
    let mut downloaded = 0u64;
    let mut result = Ok(());
    while let Some(chunk) = source.next().await {
        let sent = match chunk {
            Ok(chunk) => {
                downloaded += chunk.len() as u64;
                match transfer.push(chunk) {
                    Ok(data) => forward(&sink, data).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            result = Err(e);
            break;
        }
    }
    let result = match result {
        Ok(()) => match transfer.finish() {
            Ok(tail) => forward(&sink, tail).await,
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(downloaded),
        Err(e) => {
            // the receiver may already be gone
            let _ = sink.send(Err(io::Error::new(io::ErrorKind::Other, e.to_string()))).await;
            Err(e)
        }
    }
}

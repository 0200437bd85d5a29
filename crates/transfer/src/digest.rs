use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use md5::Md5;
use relay_protocol::{HashMethod, HashType};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

const READ_BUFFER: usize = 64 * 1024;

#[derive(Clone)]
enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
}

/// Incremental digest over a byte stream, tracking the byte count as well.
#[derive(Clone)]
pub struct DigestAccumulator {
    method: HashMethod,
    hasher: Hasher,
    bytes: u64,
}

impl DigestAccumulator {
    pub fn new(method: HashMethod) -> Self {
        let hasher = match method {
            HashMethod::Md5 => Hasher::Md5(Md5::new()),
            HashMethod::Sha256 => Hasher::Sha256(Sha256::new()),
        };
        Self {
            method,
            hasher,
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
        self.bytes += data.len() as u64;
    }

    pub fn method(&self) -> HashMethod {
        self.method
    }

    /// Bytes fed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> HashType {
        let hash = match self.hasher {
            Hasher::Md5(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
        };
        HashType::new(self.method, hash)
    }
}

/// Digest of an in-memory buffer.
pub fn digest_bytes(method: HashMethod, data: &[u8]) -> HashType {
    let mut acc = DigestAccumulator::new(method);
    acc.update(data);
    acc.finalize()
}

/// Reads `path` to the end and returns its digest.
pub async fn file_digest(path: &Path, method: HashMethod) -> io::Result<HashType> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut acc = DigestAccumulator::new(method);
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        acc.update(&buf[..n]);
    }
    Ok(acc.finalize())
}

/// Reader adapter that hashes every byte passing through it.
///
/// The digest covers exactly the bytes handed to the caller, so it matches
/// whatever the caller forwarded or stored.
pub struct DigestReader<R> {
    inner: R,
    acc: DigestAccumulator,
}

impl<R> DigestReader<R> {
    pub fn new(inner: R, method: HashMethod) -> Self {
        Self {
            inner,
            acc: DigestAccumulator::new(method),
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.acc.bytes()
    }

    /// Consumes the reader and returns the digest of everything read.
    pub fn finish(self) -> HashType {
        self.acc.finalize()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.acc.update(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

//! Receiving side of an upload.
//!
//! [`PutReceiver`] consumes one OPEN / CONTENT* / HASH sequence and commits
//! the file only after the digest checks out. Bytes land in a temp file next
//! to the destination; the destination itself is touched once, by rename.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use relay_protocol::{DEFAULT_PERMISSIONS, HashType};
use relay_transfer::{DigestAccumulator, PathPolicy};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DataChannelError;
use crate::wire::{FrameReader, PutOpen, PutRequest};
use crate::{FRAME_TIMEOUT, TCP_BUFFER_SIZE};

/// Anything that yields upload messages in order.
///
/// `Ok(None)` means the sender finished the stream.
pub trait RequestSource: Send {
    fn next_request(
        &mut self,
    ) -> impl Future<Output = Result<Option<PutRequest>, DataChannelError>> + Send;
}

impl<R: AsyncRead + Unpin + Send> RequestSource for FrameReader<R> {
    async fn next_request(&mut self) -> Result<Option<PutRequest>, DataChannelError> {
        self.next_frame().await
    }
}

impl RequestSource for mpsc::Receiver<PutRequest> {
    async fn next_request(&mut self) -> Result<Option<PutRequest>, DataChannelError> {
        Ok(self.recv().await)
    }
}

/// A file committed by the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutSummary {
    /// Final location on the filesystem (after host-mount translation).
    pub path: PathBuf,
    pub bytes: u64,
    pub digest: HashType,
}

/// Consumes uploads and writes them atomically.
#[derive(Debug, Clone)]
pub struct PutReceiver {
    policy: PathPolicy,
    frame_timeout: Duration,
    cancel: CancellationToken,
}

/// An upload whose temp file is open.
struct Upload {
    dest: PathBuf,
    temp: PathBuf,
    file: BufWriter<File>,
    permissions: u32,
    acc: DigestAccumulator,
}

enum PutState {
    AwaitOpen,
    Receiving(Upload),
    Verifying(Upload, HashType),
    Done(Upload, HashType),
    Failed(Option<Upload>, DataChannelError),
}

impl PutReceiver {
    pub fn new(policy: PathPolicy) -> Self {
        Self {
            policy,
            frame_timeout: FRAME_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets how long to wait for each message once an upload has started.
    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    /// Aborts in-flight uploads with [`DataChannelError::Cancelled`] when
    /// `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    /// Runs one upload to completion.
    ///
    /// On any failure the temp file is removed and the destination is left
    /// untouched.
    pub async fn receive<S: RequestSource>(
        &self,
        source: &mut S,
    ) -> Result<PutSummary, DataChannelError> {
        let mut state = PutState::AwaitOpen;
        loop {
            state = match state {
                PutState::AwaitOpen => match self.next(source).await {
                    Ok(Some(PutRequest::Open(open))) => match self.begin(open).await {
                        Ok(upload) => PutState::Receiving(upload),
                        Err(e) => PutState::Failed(None, e),
                    },
                    Ok(Some(_)) => PutState::Failed(
                        None,
                        DataChannelError::Protocol("first message must be Open".into()),
                    ),
                    Ok(None) => PutState::Failed(
                        None,
                        DataChannelError::Protocol("stream closed before Open".into()),
                    ),
                    Err(e) => PutState::Failed(None, e),
                },

                PutState::Receiving(mut upload) => match self.next(source).await {
                    Ok(Some(PutRequest::Content(data))) => match upload.append(&data).await {
                        Ok(()) => PutState::Receiving(upload),
                        Err(e) => PutState::Failed(Some(upload), e.into()),
                    },
                    Ok(Some(PutRequest::Hash(expected))) => PutState::Verifying(upload, expected),
                    Ok(Some(PutRequest::Open(_))) => PutState::Failed(
                        Some(upload),
                        DataChannelError::Protocol("unexpected Open after upload started".into()),
                    ),
                    Ok(None) => PutState::Failed(
                        Some(upload),
                        DataChannelError::Protocol(
                            "unexpected end of stream before hash".into(),
                        ),
                    ),
                    Err(e) => PutState::Failed(Some(upload), e),
                },

                PutState::Verifying(upload, expected) => {
                    let actual = upload.current_digest();
                    if expected.method != actual.method {
                        PutState::Failed(
                            Some(upload),
                            DataChannelError::InvalidRequest(format!(
                                "hash method {} does not match the {} announced in Open",
                                expected.method, actual.method
                            )),
                        )
                    } else if expected.hash != actual.hash {
                        warn!(
                            path = %upload.dest.display(),
                            expected = %expected,
                            actual = %actual,
                            "upload digest mismatch"
                        );
                        PutState::Failed(
                            Some(upload),
                            DataChannelError::DataCorruption { expected, actual },
                        )
                    } else {
                        PutState::Done(upload, actual)
                    }
                }

                PutState::Done(mut upload, digest) => {
                    return match upload.commit().await {
                        Ok(()) => {
                            let summary = PutSummary {
                                bytes: upload.acc.bytes(),
                                path: upload.dest,
                                digest,
                            };
                            info!(
                                path = %summary.path.display(),
                                bytes = summary.bytes,
                                digest = %summary.digest,
                                "upload committed"
                            );
                            Ok(summary)
                        }
                        Err(e) => {
                            upload.discard().await;
                            Err(e.into())
                        }
                    };
                }

                PutState::Failed(upload, err) => {
                    if let Some(upload) = upload {
                        upload.discard().await;
                    }
                    return Err(err);
                }
            };
        }
    }

    async fn next<S: RequestSource>(
        &self,
        source: &mut S,
    ) -> Result<Option<PutRequest>, DataChannelError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DataChannelError::Cancelled),
            result = tokio::time::timeout(self.frame_timeout, source.next_request()) => {
                match result {
                    Ok(r) => r,
                    Err(_) => Err(DataChannelError::Timeout),
                }
            }
        }
    }

    async fn begin(&self, open: PutOpen) -> Result<Upload, DataChannelError> {
        if open.remote_file.is_empty() {
            return Err(DataChannelError::InvalidRequest(
                "remote_file is required".into(),
            ));
        }

        let dest = self.policy.resolve(&open.remote_file)?;
        let file_name = dest.file_name().ok_or_else(|| {
            DataChannelError::InvalidRequest(format!("no file name in {}", open.remote_file))
        })?;

        let mut temp_name = file_name.to_os_string();
        let unique = uuid::Uuid::new_v4().simple().to_string();
        temp_name.push(format!(".{}.tmp", &unique[..12]));
        let temp = dest.with_file_name(temp_name);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .await?;

        let permissions = if open.permissions == 0 {
            DEFAULT_PERMISSIONS
        } else {
            open.permissions
        };

        debug!(
            path = %dest.display(),
            temp = %temp.display(),
            permissions = format_args!("{permissions:o}"),
            method = %open.method,
            "upload opened"
        );

        Ok(Upload {
            dest,
            temp,
            file: BufWriter::with_capacity(TCP_BUFFER_SIZE, file),
            permissions,
            acc: DigestAccumulator::new(open.method),
        })
    }
}

impl Upload {
    async fn append(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data).await?;
        self.acc.update(data);
        Ok(())
    }

    fn current_digest(&self) -> HashType {
        self.acc.clone().finalize()
    }

    async fn commit(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        self.file.get_mut().sync_all().await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(
                &self.temp,
                std::fs::Permissions::from_mode(self.permissions),
            )
            .await?;
        }
        tokio::fs::rename(&self.temp, &self.dest).await
    }

    async fn discard(self) {
        let Upload { temp, file, .. } = self;
        drop(file);
        if let Err(e) = tokio::fs::remove_file(&temp).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(temp = %temp.display(), error = %e, "failed to remove temp file");
            }
        }
    }
}

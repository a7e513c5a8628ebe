use std::{
    future::Future,
    io, mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use bytes::Bytes;
use hyper::{
    body::{Body, Frame, SizeHint},
    header,
};
use tokio::task::JoinHandle;

use crate::{
    blob::SpillBuffer,
    body::{BoxError, ProxyBody},
    hooks::{EventBus, HookAction, RequestHead, ResponseHead},
    message::{HeaderList, MessageId},
    store::{CapturedBody, MessageStore, MessageStoreError, ResponseCapture, RetentionLimit},
};

/// Buffered bytes that trigger a background write to the spill file.
const SPILL_FLUSH_BYTES: usize = 64 * 1024;
/// Buffered bytes at which the recorder stops reading upstream until a write finishes.
const SPILL_MAX_PENDING_BYTES: usize = 4 * SPILL_FLUSH_BYTES;

/// Everything needed to complete a capture once the response body has been streamed.
#[derive(Debug)]
pub(crate) struct Finalizer {
    pub(crate) store: MessageStore,
    pub(crate) hooks: Arc<EventBus>,
    pub(crate) retention: RetentionLimit,
    pub(crate) message_id: MessageId,
    pub(crate) request: RequestHead,
    pub(crate) response: ResponseHead,
}

impl Finalizer {
    /// Persists the response fields, fires the response hooks, then sweeps retention.
    ///
    /// Only response hook errors are returned. Datastore failures are logged and the
    /// capture is dropped, and a message evicted while its response was streaming is
    /// skipped.
    pub(crate) async fn run(self, spill: Option<SpillBuffer>) -> anyhow::Result<()> {
        let content_type = self
            .response
            .headers
            .get(header::CONTENT_TYPE)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());
        let body = spill
            .filter(|spill| !spill.is_empty())
            .map(|spill| CapturedBody {
                spill,
                content_type,
            });
        let capture = ResponseCapture {
            status_code: self.response.status.as_u16(),
            reason_phrase: self.response.reason_phrase.clone(),
            headers: HeaderList::from_header_map(&self.response.headers),
            body,
        };

        let message = match self.store.finalize_message(self.message_id, capture).await {
            Ok(message) => message,
            Err(MessageStoreError::NotFound(id)) => {
                tracing::warn!(
                    message_id = %id,
                    "message removed before its response finished; capture dropped"
                );
                return Ok(());
            }
            Err(err) => {
                tracing::error!(
                    message_id = %self.message_id,
                    "finalize captured response: {err}"
                );
                return Ok(());
            }
        };
        tracing::debug!(
            message_id = %message.id,
            status = message.status_code,
            response_bytes = message.response_body.as_ref().map_or(0, |blob| blob.size_bytes),
            "response captured"
        );

        let action = self
            .hooks
            .fire_response_captured(&self.request, &self.response, &message)?;
        if action == HookAction::Discard {
            match self.store.delete_message(message.id).await {
                Ok(_) => {
                    tracing::debug!(message_id = %message.id, "message discarded by response hook");
                }
                Err(err) => {
                    tracing::error!(message_id = %message.id, "delete discarded message: {err:#}");
                }
            }
        }

        if let Err(err) = self.store.enforce_retention(self.retention).await {
            tracing::error!("retention sweep failed: {err:#}");
        }
        Ok(())
    }
}

enum SpillState {
    Idle(SpillBuffer),
    Writing(JoinHandle<io::Result<SpillBuffer>>),
}

/// Collects response chunks and appends them to the spill file on the blocking pool.
struct SpillWriter {
    state: Option<SpillState>,
    pending: Vec<Bytes>,
    pending_len: usize,
}

impl SpillWriter {
    fn new(spill: SpillBuffer) -> Self {
        Self {
            state: Some(SpillState::Idle(spill)),
            pending: Vec::new(),
            pending_len: 0,
        }
    }

    fn push(&mut self, data: &Bytes) {
        self.pending_len += data.len();
        self.pending.push(data.clone());
    }

    /// Advances any in-flight write and starts a new one once enough bytes are buffered.
    ///
    /// Returns `Pending` only when the buffer is full and a write is still running.
    fn poll_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(SpillState::Writing(handle)) = self.state.as_mut() {
            let joined = if self.pending_len >= SPILL_MAX_PENDING_BYTES {
                ready!(Pin::new(handle).poll(cx))
            } else {
                match Pin::new(handle).poll(cx) {
                    Poll::Ready(joined) => joined,
                    Poll::Pending => return Poll::Ready(Ok(())),
                }
            };
            self.state = Some(SpillState::Idle(joined.map_err(io::Error::other)??));
        }

        if self.pending_len >= SPILL_FLUSH_BYTES {
            if let Some(SpillState::Idle(spill)) = self.state.take() {
                let chunks = mem::take(&mut self.pending);
                self.pending_len = 0;
                self.state = Some(SpillState::Writing(tokio::task::spawn_blocking(
                    move || append_chunks(spill, chunks),
                )));
            }
        }
        Poll::Ready(Ok(()))
    }

    /// Waits for in-flight writes and appends whatever is still buffered.
    async fn finish(self) -> io::Result<SpillBuffer> {
        let spill = match self.state {
            Some(SpillState::Idle(spill)) => spill,
            Some(SpillState::Writing(handle)) => handle.await.map_err(io::Error::other)??,
            None => return Err(io::Error::other("spill buffer lost")),
        };
        if self.pending.is_empty() {
            return Ok(spill);
        }
        let chunks = self.pending;
        tokio::task::spawn_blocking(move || append_chunks(spill, chunks))
            .await
            .map_err(io::Error::other)?
    }
}

fn append_chunks(mut spill: SpillBuffer, chunks: Vec<Bytes>) -> io::Result<SpillBuffer> {
    for chunk in &chunks {
        spill.append(chunk)?;
    }
    Ok(spill)
}

async fn complete_capture(writer: SpillWriter, finalizer: Finalizer) -> anyhow::Result<()> {
    match writer.finish().await {
        Ok(spill) => finalizer.run(Some(spill)).await,
        Err(err) => {
            tracing::warn!(
                message_id = %finalizer.message_id,
                "response spill write failed; capture abandoned: {err}"
            );
            Ok(())
        }
    }
}

/// Response body decorator that forwards every frame unchanged while tee-ing data
/// frames into a spill buffer.
///
/// End of stream is reported to the caller only after the message has been finalized.
/// If the wrapped body fails, the spill buffer is dropped, nothing is finalized and the
/// original error is forwarded. Dropping the recorder early (client disconnect) discards
/// the capture the same way.
pub struct ResponseRecorder {
    inner: ProxyBody,
    spill: Option<SpillWriter>,
    finalizer: Option<Finalizer>,
    finalizing: Option<JoinHandle<anyhow::Result<()>>>,
    done: bool,
}

impl ResponseRecorder {
    pub(crate) fn new(inner: ProxyBody, spill: SpillBuffer, finalizer: Finalizer) -> Self {
        Self {
            inner,
            spill: Some(SpillWriter::new(spill)),
            finalizer: Some(finalizer),
            finalizing: None,
            done: false,
        }
    }

    fn abandon(&mut self) -> Option<MessageId> {
        self.spill = None;
        self.finalizer.take().map(|finalizer| finalizer.message_id)
    }

    fn poll_spill(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(spill) = self.spill.as_mut() else {
            return Poll::Ready(());
        };
        if let Err(err) = ready!(spill.poll_write(cx)) {
            if let Some(message_id) = self.abandon() {
                tracing::warn!(
                    message_id = %message_id,
                    "response spill write failed; capture abandoned: {err}"
                );
            }
        }
        Poll::Ready(())
    }
}

impl Body for ResponseRecorder {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }

            if let Some(finalizing) = this.finalizing.as_mut() {
                let joined = ready!(Pin::new(finalizing).poll(cx));
                this.finalizing = None;
                this.done = true;
                return match joined {
                    Ok(Ok(())) => Poll::Ready(None),
                    Ok(Err(err)) => {
                        tracing::error!("response hook failed: {err:#}");
                        Poll::Ready(Some(Err(err.into())))
                    }
                    Err(err) => {
                        tracing::error!("finalize task failed: {err}");
                        Poll::Ready(Some(Err(Box::new(err))))
                    }
                };
            }

            ready!(this.poll_spill(cx));

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if let (Some(data), Some(spill)) = (frame.data_ref(), this.spill.as_mut()) {
                        spill.push(data);
                    }
                    return Poll::Ready(Some(Ok(frame)));
                }
                Some(Err(err)) => {
                    if let Some(message_id) = this.abandon() {
                        tracing::debug!(
                            message_id = %message_id,
                            "response stream failed; capture abandoned"
                        );
                    }
                    return Poll::Ready(Some(Err(err)));
                }
                None => match (this.spill.take(), this.finalizer.take()) {
                    (Some(spill), Some(finalizer)) => {
                        this.finalizing =
                            Some(tokio::spawn(complete_capture(spill, finalizer)));
                    }
                    _ => this.done = true,
                },
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        if self.finalizer.is_some() || self.finalizing.is_some() {
            return false;
        }
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

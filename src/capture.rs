use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context as _, anyhow};
use http_body_util::BodyExt as _;
use hyper::{
    Method, Request, Response, StatusCode,
    ext::ReasonPhrase,
    header::{self, HeaderMap},
    http::response::Parts,
};

use crate::{
    body::{ProxyBody, boxed_full},
    config::Config,
    hooks::{EventBus, HookAction, RequestHead, ResponseHead},
    message::{HeaderList, Message, NewMessage},
    recorder::{Finalizer, ResponseRecorder},
    store::{CapturedBody, MessageStore, RetentionLimit},
    tap::TapRegistry,
};

/// Records tapped request/response exchanges around an inner handler.
///
/// A disabled middleware passes every request and response through untouched.
#[derive(Debug, Clone)]
pub struct CaptureMiddleware {
    pipeline: Option<Arc<CapturePipeline>>,
}

#[derive(Debug)]
struct CapturePipeline {
    store: MessageStore,
    taps: TapRegistry,
    hooks: Arc<EventBus>,
    retention: RetentionLimit,
}

/// Carries a captured request to the response phase.
#[derive(Debug, Default)]
pub struct CaptureContext {
    pending: Option<PendingCapture>,
}

#[derive(Debug)]
struct PendingCapture {
    message: Message,
    request: RequestHead,
}

impl CaptureContext {
    /// The message recorded for this request, if the request was captured.
    pub fn message(&self) -> Option<&Message> {
        self.pending.as_ref().map(|pending| &pending.message)
    }
}

impl CaptureMiddleware {
    pub fn new(
        store: MessageStore,
        taps: TapRegistry,
        hooks: EventBus,
        retention: RetentionLimit,
    ) -> Self {
        Self {
            pipeline: Some(Arc::new(CapturePipeline {
                store,
                taps,
                hooks: Arc::new(hooks),
                retention,
            })),
        }
    }

    pub fn disabled() -> Self {
        Self { pipeline: None }
    }

    /// Capture runs only when the server is in debug mode.
    pub fn from_config(config: &Config, store: MessageStore, hooks: EventBus) -> Self {
        if !config.server.debug {
            tracing::info!("capture disabled; server is not in debug mode");
            return Self::disabled();
        }

        let taps = TapRegistry::new(&store);
        tracing::info!(
            storage = %config.storage.path.display(),
            max_messages = %config.capture.max_messages,
            "capture enabled"
        );
        Self::new(store, taps, hooks, config.capture.max_messages)
    }

    pub fn is_enabled(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Captures the request when its path matches a tap.
    ///
    /// The body is buffered, persisted and replayed into the returned request unchanged.
    /// The new message's id is inserted into the request extensions.
    pub async fn process_request(
        &self,
        req: Request<ProxyBody>,
        remote_addr: SocketAddr,
    ) -> anyhow::Result<(Request<ProxyBody>, CaptureContext)> {
        let Some(pipeline) = self.pipeline.as_deref() else {
            return Ok((req, CaptureContext::default()));
        };
        if !pipeline.taps.should_capture(req.uri().path()).await? {
            return Ok((req, CaptureContext::default()));
        }

        let started_at_unix_ms = Message::now_unix_ms()?;
        let (mut parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|err| anyhow!("read request body: {err}"))?
            .to_bytes();

        let captured_body = if body_bytes.is_empty() {
            None
        } else {
            let spill = pipeline
                .store
                .spill_bytes(body_bytes.clone())
                .await
                .context("buffer request body")?;
            Some(CapturedBody {
                spill,
                content_type: header_string(&parts.headers, header::CONTENT_TYPE),
            })
        };

        let new_message = NewMessage {
            started_at_unix_ms,
            ended_at_unix_ms: Message::now_unix_ms()?,
            remote_addr: remote_addr.ip().to_string(),
            method: parts.method.to_string(),
            path: parts.uri.path().to_owned(),
            request_headers: HeaderList::from_header_map(&parts.headers),
        };
        let message = pipeline
            .store
            .create_message(new_message, captured_body)
            .await?;
        tracing::debug!(
            message_id = %message.id,
            method = %message.method,
            path = %message.path,
            request_bytes = message.request_body.as_ref().map_or(0, |blob| blob.size_bytes),
            "request captured"
        );

        let request = RequestHead {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
            remote_addr,
        };
        let action = pipeline.hooks.fire_request_captured(&request, &message)?;
        if action == HookAction::Discard {
            pipeline.store.delete_message(message.id).await?;
            tracing::debug!(message_id = %message.id, "message discarded by request hook");
            return Ok((
                Request::from_parts(parts, boxed_full(body_bytes)),
                CaptureContext::default(),
            ));
        }

        parts.extensions.insert(message.id);
        Ok((
            Request::from_parts(parts, boxed_full(body_bytes)),
            CaptureContext {
                pending: Some(PendingCapture { message, request }),
            },
        ))
    }

    /// Wraps the response body in a [`ResponseRecorder`] for a captured request.
    ///
    /// Responses that never carry a body (HEAD, 1xx, 204, 304) are finalized before
    /// returning, so a response hook error for them is returned here. If no spill
    /// buffer can be opened the response is returned untouched and the message stays in
    /// its request-captured state.
    pub async fn process_response(
        &self,
        ctx: CaptureContext,
        response: Response<ProxyBody>,
    ) -> anyhow::Result<Response<ProxyBody>> {
        let (Some(pipeline), Some(pending)) = (self.pipeline.as_deref(), ctx.pending) else {
            return Ok(response);
        };

        let (parts, body) = response.into_parts();
        let finalizer = Finalizer {
            store: pipeline.store.clone(),
            hooks: Arc::clone(&pipeline.hooks),
            retention: pipeline.retention,
            message_id: pending.message.id,
            response: ResponseHead {
                status: parts.status,
                reason_phrase: reason_phrase(&parts),
                headers: parts.headers.clone(),
            },
            request: pending.request,
        };

        if is_bodiless(&finalizer.request.method, parts.status) {
            finalizer.run(None).await?;
            return Ok(Response::from_parts(parts, body));
        }

        let spill = match pipeline.store.open_spill().await {
            Ok(spill) => spill,
            Err(err) => {
                tracing::warn!(
                    message_id = %pending.message.id,
                    "response capture skipped: {err:#}"
                );
                return Ok(Response::from_parts(parts, body));
            }
        };

        let recorder = ResponseRecorder::new(body, spill, finalizer);
        Ok(Response::from_parts(parts, recorder.boxed()))
    }

    /// Runs `next` between the request and response phases.
    pub async fn handle<F, Fut>(
        &self,
        req: Request<ProxyBody>,
        remote_addr: SocketAddr,
        next: F,
    ) -> anyhow::Result<Response<ProxyBody>>
    where
        F: FnOnce(Request<ProxyBody>) -> Fut,
        Fut: Future<Output = anyhow::Result<Response<ProxyBody>>>,
    {
        let (req, ctx) = self.process_request(req, remote_addr).await?;
        let response = next(req).await?;
        self.process_response(ctx, response).await
    }
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
}

/// Reason phrase sent by the upstream, else the canonical one, else empty.
fn reason_phrase(parts: &Parts) -> String {
    if let Some(reason) = parts.extensions.get::<ReasonPhrase>() {
        return String::from_utf8_lossy(reason.as_bytes()).into_owned();
    }
    parts
        .status
        .canonical_reason()
        .unwrap_or_default()
        .to_owned()
}

fn is_bodiless(method: &Method, status: StatusCode) -> bool {
    *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

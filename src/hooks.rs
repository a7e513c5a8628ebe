use std::{net::SocketAddr, sync::Arc};

use hyper::{HeaderMap, Method, StatusCode, Uri};

use crate::message::Message;

/// Request head as seen by the capture pipeline. The body has already been captured.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: SocketAddr,
}

/// Response head copied from the wrapped response before streaming began.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason_phrase: String,
    pub headers: HeaderMap,
}

/// What a hook wants done with the message it observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookAction {
    #[default]
    Keep,
    /// Delete the message and its blobs.
    Discard,
}

pub trait RequestCapturedHook: Send + Sync {
    fn on_request_captured(
        &self,
        request: &RequestHead,
        message: &Message,
    ) -> anyhow::Result<HookAction>;
}

pub trait ResponseCapturedHook: Send + Sync {
    fn on_response_captured(
        &self,
        request: &RequestHead,
        response: &ResponseHead,
        message: &Message,
    ) -> anyhow::Result<HookAction>;
}

impl<F> RequestCapturedHook for F
where
    F: Fn(&RequestHead, &Message) -> anyhow::Result<HookAction> + Send + Sync,
{
    fn on_request_captured(
        &self,
        request: &RequestHead,
        message: &Message,
    ) -> anyhow::Result<HookAction> {
        self(request, message)
    }
}

impl<F> ResponseCapturedHook for F
where
    F: Fn(&RequestHead, &ResponseHead, &Message) -> anyhow::Result<HookAction> + Send + Sync,
{
    fn on_response_captured(
        &self,
        request: &RequestHead,
        response: &ResponseHead,
        message: &Message,
    ) -> anyhow::Result<HookAction> {
        self(request, response, message)
    }
}

/// Ordered subscriber lists for the two capture points.
///
/// Subscribers run in subscription order and all of them run; the message is discarded
/// if any returned [`HookAction::Discard`]. The first error stops dispatch and is
/// returned unchanged.
#[derive(Default, Clone)]
pub struct EventBus {
    request_captured: Vec<Arc<dyn RequestCapturedHook>>,
    response_captured: Vec<Arc<dyn ResponseCapturedHook>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("request_captured", &self.request_captured.len())
            .field("response_captured", &self.response_captured.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_request_captured(&mut self, hook: impl RequestCapturedHook + 'static) {
        self.request_captured.push(Arc::new(hook));
    }

    pub fn subscribe_response_captured(&mut self, hook: impl ResponseCapturedHook + 'static) {
        self.response_captured.push(Arc::new(hook));
    }

    pub fn fire_request_captured(
        &self,
        request: &RequestHead,
        message: &Message,
    ) -> anyhow::Result<HookAction> {
        let mut action = HookAction::Keep;
        for hook in &self.request_captured {
            if hook.on_request_captured(request, message)? == HookAction::Discard {
                action = HookAction::Discard;
            }
        }
        Ok(action)
    }

    pub fn fire_response_captured(
        &self,
        request: &RequestHead,
        response: &ResponseHead,
        message: &Message,
    ) -> anyhow::Result<HookAction> {
        let mut action = HookAction::Keep;
        for hook in &self.response_captured {
            if hook.on_response_captured(request, response, message)? == HookAction::Discard {
                action = HookAction::Discard;
            }
        }
        Ok(action)
    }
}

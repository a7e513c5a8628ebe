use std::error::Error as StdError;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::body::Incoming;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Body type flowing through the capture pipeline and the host server.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

pub fn boxed_full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| -> BoxError { match never {} })
        .boxed()
}

pub fn boxed_incoming(body: Incoming) -> ProxyBody {
    body.map_err(|err| -> BoxError { Box::new(err) }).boxed()
}

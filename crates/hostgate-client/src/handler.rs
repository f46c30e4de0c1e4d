//! Request handler seam
//!
//! Whatever answers tunneled requests on the client side implements
//! `RequestHandler`: a local HTTP proxy, or an in-process closure.

use async_trait::async_trait;
use hostgate_proto::{TunnelRequest, TunnelResponse};
use std::future::Future;
use std::sync::Arc;

/// Error a handler may return; it is logged and never sent as a response
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: TunnelRequest) -> Result<TunnelResponse, HandlerError>;
}

#[async_trait]
impl<H> RequestHandler for Arc<H>
where
    H: RequestHandler + ?Sized,
{
    async fn handle(&self, request: TunnelRequest) -> Result<TunnelResponse, HandlerError> {
        (**self).handle(request).await
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a `RequestHandler`
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TunnelRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TunnelResponse, HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(TunnelRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TunnelResponse, HandlerError>> + Send,
{
    async fn handle(&self, request: TunnelRequest) -> Result<TunnelResponse, HandlerError> {
        (self.f)(request).await
    }
}

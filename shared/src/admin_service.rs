use crate::http::make_boxed_error_response;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Liveness and readiness endpoints served on the admin listener.
///
/// `/health` always answers once the process accepts connections, `/ready`
/// consults the probe so orchestrators can hold traffic until the service has
/// loaded its registrations.
pub struct AdminService<F, E> {
    is_ready: F,
    _error: PhantomData<E>,
}

impl<F, E> AdminService<F, E>
where
    F: Fn() -> bool,
{
    pub fn new(is_ready: F) -> Self {
        Self {
            is_ready,
            _error: PhantomData,
        }
    }
}

/// Status code the admin service answers with for a method/path pair.
pub fn admin_status(method: &Method, path: &str, is_ready: bool) -> StatusCode {
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED;
    }
    match path {
        "/health" => StatusCode::OK,
        "/ready" if is_ready => StatusCode::OK,
        "/ready" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::NOT_FOUND,
    }
}

impl<F, E> Service<Request<Incoming>> for AdminService<F, E>
where
    F: Fn() -> bool + Send + 'static,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let status = admin_status(req.method(), req.uri().path(), (self.is_ready)());

        Box::pin(async move {
            let res = match status {
                StatusCode::OK => Response::new(Full::new(Bytes::from("ok\n")).boxed()),
                other => make_boxed_error_response(other),
            };
            Ok(res)
        })
    }
}

use std::future::Future;

use hyper::{Body, Request, Response};
use routerify::{Middleware, Router, RouterBuilder, RouterService};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use super::error::{route_error_handler, ApiError};

/// Runs the handler inside a span carrying the request method and path, so
/// everything the handler logs is attributable to the request.
pub async fn request_span<R, H>(request: Request<Body>, handler: H) -> Result<Response<Body>, ApiError>
where
    R: Future<Output = Result<Response<Body>, ApiError>> + Send + 'static,
    H: FnOnce(Request<Body>) -> R + Send + Sync + 'static,
{
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let request_span = info_span!("request", %method, %path);

    async move {
        debug!("Handling request");
        let res = handler(request).await;
        if let Ok(response) = &res {
            let status = response.status();
            info!(%status, "Request handled");
        }
        res
    }
    .instrument(request_span)
    .await
}

/// Pre-middleware comparing the `Authorization` header against a shared
/// secret. Requests with a missing or mismatching token get 401.
pub fn token_auth_middleware(expected: String) -> Middleware<Body, ApiError> {
    Middleware::pre(move |request: Request<Body>| {
        let expected = expected.clone();
        async move {
            let provided = request
                .headers()
                .get(hyper::header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok());
            match provided {
                Some(token) if token == expected => Ok(request),
                Some(_) => Err(ApiError::Unauthorized("invalid token".to_string())),
                None => Err(ApiError::Unauthorized(
                    "missing authorization header".to_string(),
                )),
            }
        }
    })
}

pub fn make_router() -> RouterBuilder<Body, ApiError> {
    Router::builder().err_handler_with_info(route_error_handler)
}

/// Serves `router_builder` on `listener` until `cancel` fires; in-flight
/// requests are allowed to finish.
pub async fn serve(
    router_builder: RouterBuilder<Body, ApiError>,
    listener: std::net::TcpListener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let router = router_builder
        .build()
        .map_err(|err| anyhow::anyhow!("Failed to build http router: {err}"))?;
    let service = RouterService::new(router)
        .map_err(|err| anyhow::anyhow!("Failed to build http service: {err}"))?;
    listener.set_nonblocking(true)?;
    let server = hyper::Server::from_tcp(listener)?
        .serve(service)
        .with_graceful_shutdown(cancel.cancelled_owned());
    server.await?;
    Ok(())
}

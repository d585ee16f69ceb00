//! Domain-remapping middleware: rewrites `<account>.<public>/v2/...`
//! requests to `<public>/v2/<account>/...` before they reach the OCI
//! routes, and rewrites any `Location` response header back.
//!
//! `X-Keppel-Forwarded-By` guards against a reverse proxy looping a
//! request back to us after we already rewrote it once.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

use super::host_from_headers;
use crate::audience::identify_audience;
use crate::AppState;

const FORWARDED_BY_HEADER: &str = "x-keppel-forwarded-by";

pub async fn domain_remap_middleware(State(state): State<Arc<AppState>>, mut request: Request<Body>, next: Next) -> Response {
    if request.headers().contains_key(FORWARDED_BY_HEADER) {
        return Response::builder()
            .status(508)
            .body(Body::from("loop detected: request already forwarded once"))
            .expect("static response body is valid");
    }

    let host = host_from_headers(request.headers());
    let account_name = host
        .as_deref()
        .map(|h| identify_audience(h, &state.config))
        .filter(|a| a.is_domain_remapped())
        .map(|a| a.account_name);

    let Some(account_name) = account_name else {
        return next.run(request).await;
    };

    let path = request.uri().path();
    if let Some(rest) = path.strip_prefix("/v2/") {
        let rewritten = format!("/v2/{account_name}/{rest}");
        rewrite_path(&mut request, &rewritten);
    } else if path == "/v2" || path == "/v2/" {
        rewrite_path(&mut request, &format!("/v2/{account_name}/"));
    }

    if let Some(h) = &host {
        if let Ok(value) = HeaderValue::from_str(h) {
            request.headers_mut().insert(header::HeaderName::from_static("x-forwarded-host"), value);
        }
    }
    request
        .headers_mut()
        .insert(header::HeaderName::from_static(FORWARDED_BY_HEADER), HeaderValue::from_static("1"));

    let mut response = next.run(request).await;

    if let Some(location) = response.headers().get(header::LOCATION).cloned() {
        if let Ok(text) = location.to_str() {
            if let Some(rest) = text.strip_prefix(&format!("/v2/{account_name}/")) {
                let rewritten = format!("/v2/{rest}");
                if let Ok(value) = HeaderValue::from_str(&rewritten) {
                    response.headers_mut().insert(header::LOCATION, value);
                }
            }
        }
    }

    response
}

fn rewrite_path(request: &mut Request<Body>, new_path: &str) {
    let mut parts = request.uri().clone().into_parts();
    let query = parts.path_and_query.as_ref().and_then(|pq| pq.query()).map(|q| q.to_string());
    let path_and_query = match query {
        Some(q) => format!("{new_path}?{q}"),
        None => new_path.to_string(),
    };
    if let Ok(pq) = path_and_query.parse() {
        parts.path_and_query = Some(pq);
        if let Ok(uri) = axum::http::Uri::from_parts(parts) {
            *request.uri_mut() = uri;
        }
    }
}

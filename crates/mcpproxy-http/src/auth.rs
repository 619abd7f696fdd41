//! API-key authentication middleware (spec §6): every REST and SSE route
//! requires `X-API-Key` or `?apikey=`; `/mcp` and the liveness probes bypass
//! this entirely and are mounted outside the layer that applies it.
//!
//! Pattern grounded on the teacher's `authentication_middleware` (header
//! check, `State` extraction, reject with a bare status code before the
//! handler runs).

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use crate::state::AppState;

const API_KEY_HEADER: &str = "x-api-key";
const API_KEY_QUERY_PARAM: &str = "apikey";

pub async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, StatusCode> {
    let header_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    let query_key = request.uri().query().and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == API_KEY_QUERY_PARAM)
            .map(|(_, v)| v.into_owned())
    });

    let provided = header_key.map(str::to_string).or(query_key);
    match provided {
        Some(key) if key == state.api_key => Ok(next.run(request).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

use crate::chain::MinerRound;
use crate::clients::{ClientData, ClientRegistry};
use crate::com::api;
use crate::proxy::{Proxy, SubmitOutcome};
use bytes::Bytes;
use governor::{Quota, RateLimiter};
use hyper::header::{HeaderMap, CONTENT_TYPE};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

pub type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// A rate of zero disables limiting.
pub fn limiter(rate: u32, burst: u32) -> Option<Arc<DirectLimiter>> {
    let rate = NonZeroU32::new(rate)?;
    let mut quota = Quota::per_second(rate);
    if let Some(burst) = NonZeroU32::new(burst) {
        quota = quota.allow_burst(burst);
    }
    Some(Arc::new(RateLimiter::direct(quota)))
}

pub async fn run(
    proxy: Arc<Proxy>,
    listen: SocketAddr,
    limiter: Option<Arc<DirectLimiter>>,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let remote = conn.remote_addr();
        let proxy = proxy.clone();
        let limiter = limiter.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let proxy = proxy.clone();
                let limiter = limiter.clone();
                async move {
                    if let Some(limiter) = limiter.as_deref() {
                        if limiter.check().is_err() {
                            return Ok::<_, Infallible>(text_response(
                                StatusCode::TOO_MANY_REQUESTS,
                                "limit exceeded",
                            ));
                        }
                    }
                    Ok::<_, Infallible>(handle(&proxy, remote, req).await)
                }
            }))
        }
    });
    info!("listening for miners on {}", listen);
    Server::try_bind(&listen)?.serve(make_svc).await
}

/// Single miner-facing endpoint, dispatched on the requestType form field.
pub async fn handle(proxy: &Proxy, remote: SocketAddr, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let body = match hyper::body::to_bytes(body).await {
        Ok(body) => body,
        Err(_) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                api::error_body(1, "unreadable request body"),
            )
        }
    };
    let params = form_params(parts.uri.query(), &body);

    match params.get("requestType").map(String::as_str) {
        Some("getMiningInfo") => get_mining_info(proxy, remote, &parts.headers),
        Some("submitNonce") => submit_nonce(proxy, remote, &parts.headers, &params).await,
        _ => json_response(
            StatusCode::BAD_REQUEST,
            api::error_body(4, "unknown request type"),
        ),
    }
}

/// Body fields take precedence over the query string.
pub(crate) fn form_params(query: Option<&str>, body: &[u8]) -> HashMap<String, String> {
    let mut params: HashMap<String, String> = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(body) {
        params.insert(key.into_owned(), value.into_owned());
    }
    for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        params.entry(key.into_owned()).or_insert_with(|| value.into_owned());
    }
    params
}

fn get_mining_info(proxy: &Proxy, remote: SocketAddr, headers: &HeaderMap) -> Response<Body> {
    update_client(proxy, remote, headers);
    match proxy.chains.serving_mining_info() {
        Some(mi) => bytes_response(StatusCode::OK, mi.payload.clone()),
        None => json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            api::error_body(3, "no mining info available yet"),
        ),
    }
}

async fn submit_nonce(
    proxy: &Proxy,
    remote: SocketAddr,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Response<Body> {
    let account_id = match parse_u64(params, "accountId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let nonce = match parse_u64(params, "nonce") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let height = match parse_u64(params, "blockheight") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    // no deadline in the form means the miner pre-divided it and put it in
    // the X-Deadline header
    let (deadline, adjusted) = match params.get("deadline") {
        Some(raw) => match raw.parse() {
            Ok(v) => (v, false),
            Err(_) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    api::error_body(1, "malformed field deadline"),
                )
            }
        },
        None => match headers
            .get("X-Deadline")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
        {
            Some(v) => (v, true),
            None => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    api::error_body(1, "missing field deadline"),
                )
            }
        },
    };

    let round = MinerRound {
        account_id,
        height,
        nonce,
        deadline,
        secret_phrase: params.get("secretPhrase").cloned(),
        adjusted,
    };

    match proxy.submit_round(remote, round).await {
        SubmitOutcome::Updated(body) => bytes_response(StatusCode::OK, body),
        SubmitOutcome::NotUpdated(deadline) => {
            json_response(StatusCode::OK, api::success_body(deadline))
        }
        SubmitOutcome::WrongHeight => {
            json_response(StatusCode::BAD_REQUEST, api::wrong_height_body())
        }
        SubmitOutcome::ExceededMinersPerIp => json_response(
            StatusCode::BAD_REQUEST,
            api::error_body(2, "too many miners from your address"),
        ),
        SubmitOutcome::RemoteErr(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            api::error_body(3, &e.to_string()),
        ),
    }
}

fn update_client(proxy: &Proxy, remote: SocketAddr, headers: &HeaderMap) {
    let miner_name = header_str(headers, "X-Miner");
    let alias = header_str(headers, "X-MinerAlias");
    let xpu = header_str(headers, "X-Xpu");
    let capacity_gib = header_str(headers, "X-Capacity").parse().unwrap_or(0);
    let key = ClientRegistry::fingerprint(
        &remote.ip().to_string(),
        remote.port(),
        &miner_name,
        &xpu,
    );
    proxy.clients.update(
        key,
        ClientData {
            miner_name,
            alias,
            xpu,
            capacity_gib,
        },
    );
    proxy.notify_capacity(proxy.clients.total_capacity_gib());
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned()
}

fn parse_u64(params: &HashMap<String, String>, field: &str) -> Result<u64, Response<Body>> {
    params.get(field).and_then(|v| v.parse().ok()).ok_or_else(|| {
        json_response(
            StatusCode::BAD_REQUEST,
            api::error_body(1, &format!("malformed field {}", field)),
        )
    })
}

fn json_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("response builder")
}

fn bytes_response(status: StatusCode, body: Bytes) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("response builder")
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(Body::from(body))
        .expect("response builder")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::testutil::seeded_proxy;

    fn addr() -> SocketAddr {
        SocketAddr::from(([1, 1, 1, 1], 5000))
    }

    async fn body_string(resp: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_form_params_body_wins_over_query() {
        let params = form_params(Some("a=1&b=2"), b"a=3&c=4");
        assert_eq!(params["a"], "3");
        assert_eq!(params["b"], "2");
        assert_eq!(params["c"], "4");
    }

    #[tokio::test]
    async fn test_get_mining_info_serves_payload_and_registers_client() {
        let (proxy, _mock) = seeded_proxy(3);
        let req = Request::builder()
            .method("GET")
            .uri("/burst?requestType=getMiningInfo")
            .header("X-Miner", "Bencher/1.1.0")
            .header("X-MinerAlias", "rig1")
            .header("X-Xpu", "cpu")
            .header("X-Capacity", "100")
            .body(Body::empty())
            .unwrap();
        let resp = handle(&proxy, addr(), req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["height"], "100");
        assert_eq!(value["baseTarget"], "10");
        assert_eq!(proxy.clients.total_capacity_gib(), 100);
    }

    #[tokio::test]
    async fn test_submit_nonce_roundtrip() {
        let (proxy, mock) = seeded_proxy(3);
        let req = Request::builder()
            .method("POST")
            .uri("/burst?requestType=submitNonce&accountId=1&nonce=7&blockheight=100&deadline=5000")
            .body(Body::empty())
            .unwrap();
        let resp = handle(&proxy, addr(), req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_string(resp).await,
            r#"{"deadline":500,"result":"success"}"#
        );
        assert_eq!(mock.submitted().len(), 1);
        assert!(!mock.submitted()[0].0.adjusted);
    }

    #[tokio::test]
    async fn test_x_deadline_header_marks_submission_adjusted() {
        let (proxy, mock) = seeded_proxy(3);
        let req = Request::builder()
            .method("POST")
            .uri("/burst?requestType=submitNonce&accountId=1&nonce=7&blockheight=100")
            .header("X-Deadline", "500")
            .body(Body::empty())
            .unwrap();
        let resp = handle(&proxy, addr(), req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let submitted = mock.submitted();
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].0.adjusted);
        assert_eq!(submitted[0].0.deadline, 500);
    }

    #[tokio::test]
    async fn test_malformed_account_id() {
        let (proxy, mock) = seeded_proxy(3);
        let req = Request::builder()
            .method("POST")
            .uri("/burst?requestType=submitNonce&accountId=xyz&nonce=7&blockheight=100&deadline=5000")
            .body(Body::empty())
            .unwrap();
        let resp = handle(&proxy, addr(), req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("accountId"));
        assert!(mock.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_height_envelope() {
        let (proxy, _mock) = seeded_proxy(3);
        let req = Request::builder()
            .method("POST")
            .uri("/burst?requestType=submitNonce&accountId=1&nonce=7&blockheight=99&deadline=5000")
            .body(Body::empty())
            .unwrap();
        let resp = handle(&proxy, addr(), req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_string(resp).await;
        assert!(body.contains("1005"));
        assert!(body.contains("Submitted on wrong height"));
    }

    #[tokio::test]
    async fn test_unknown_request_type() {
        let (proxy, _mock) = seeded_proxy(3);
        let req = Request::builder()
            .method("POST")
            .uri("/burst?requestType=getPlots")
            .body(Body::empty())
            .unwrap();
        let resp = handle(&proxy, addr(), req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("\"code\":4"));
    }

    #[tokio::test]
    async fn test_form_fields_accepted_in_body() {
        let (proxy, mock) = seeded_proxy(3);
        let req = Request::builder()
            .method("POST")
            .uri("/burst")
            .body(Body::from(
                "requestType=submitNonce&accountId=1&nonce=7&blockheight=100&deadline=5000",
            ))
            .unwrap();
        let resp = handle(&proxy, addr(), req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(mock.submitted().len(), 1);
    }
}

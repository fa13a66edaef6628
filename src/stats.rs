use crate::clients::ClientRegistry;
use crate::server::DirectLimiter;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

/// Plain-text miner table for operators.
pub fn render(clients: &ClientRegistry) -> String {
    let mut out = String::from("Bencher Stats\n");
    let mut total_gib = 0u64;
    for (hash, client) in clients.snapshot() {
        let hashrate = client.capacity_gib as f64 / 240.0 / 1e6 * 8192.0 * 4.0 * 1024.0;
        out.push_str(&format!(
            "Miner: {} {} {} {:.2}MH/s {}GiB {}\n",
            hash, client.alias, client.miner_name, hashrate, client.capacity_gib, client.xpu
        ));
        total_gib += client.capacity_gib;
    }
    out.push_str(&format!(
        "Total Capacity: {:.3} TiB\n",
        total_gib as f64 / 1024.0
    ));
    out
}

pub async fn run(
    clients: Arc<ClientRegistry>,
    listen: SocketAddr,
    limiter: Option<Arc<DirectLimiter>>,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn: &AddrStream| {
        let clients = clients.clone();
        let limiter = limiter.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |_req| {
                let clients = clients.clone();
                let limiter = limiter.clone();
                async move {
                    if let Some(limiter) = limiter.as_deref() {
                        if limiter.check().is_err() {
                            return Ok::<_, Infallible>(
                                Response::builder()
                                    .status(StatusCode::TOO_MANY_REQUESTS)
                                    .body(Body::from("limit exceeded"))
                                    .expect("response builder"),
                            );
                        }
                    }
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(StatusCode::OK)
                            .header(CONTENT_TYPE, "text/plain")
                            .body(Body::from(render(&clients)))
                            .expect("response builder"),
                    )
                }
            }))
        }
    });
    info!("serving stats on {}", listen);
    Server::try_bind(&listen)?.serve(make_svc).await
}

//! HTTP surface: metrics, webhook deliveries and reload
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::app::App;
use crate::error::{ExporterError, Result};
use crate::eventsub::WebhookRequest;
use crate::exposition::CONTENT_TYPE;

/// Path the event subscription provider posts deliveries to
pub const EVENTSUB_PATH: &str = "/eventsub";

/// Path that triggers a configuration reload
pub const RELOAD_PATH: &str = "/-/reload";

/// Query parameter selecting a subset of collectors for one scrape
pub const COLLECT_PARAM: &str = "collect[]";

/// Accept connections on `listener` until the task is dropped
pub async fn serve(app: Arc<App>, listener: TcpListener, telemetry_path: String) -> Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    let telemetry_path = Arc::new(telemetry_path);

    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let app = Arc::clone(&app);
        let telemetry_path = Arc::clone(&telemetry_path);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let app = Arc::clone(&app);
                let telemetry_path = Arc::clone(&telemetry_path);
                async move { Ok::<_, Infallible>(dispatch(&app, &telemetry_path, req).await) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Connection from {} closed with error: {}", peer, e);
            }
        });
    }
}

async fn dispatch(app: &App, telemetry_path: &str, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Could not read request body: {}", e);
            return text(StatusCode::BAD_REQUEST, "could not read request body");
        }
    };
    route(app, telemetry_path, Request::from_parts(parts, body)).await
}

/// Answer one fully buffered request
pub async fn route(app: &App, telemetry_path: &str, req: Request<Bytes>) -> Response<Full<Bytes>> {
    let path = req.uri().path();

    match (req.method(), path) {
        (&Method::GET, p) if p == telemetry_path => {
            let filters = collect_filters(req.uri());
            match app.scrape(&filters).await {
                Ok(body) => Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", CONTENT_TYPE)
                    .body(Full::new(Bytes::from(body)))
                    .unwrap_or_else(|_| text(StatusCode::INTERNAL_SERVER_ERROR, "response build failed")),
                Err(ExporterError::Config(message)) => {
                    warn!("Rejected scrape: {}", message);
                    text(StatusCode::BAD_REQUEST, &format!("Couldn't create filtered metrics handler: {}", message))
                }
                Err(e) => {
                    error!("Scrape failed: {}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
                }
            }
        }
        (&Method::POST, EVENTSUB_PATH) => {
            let request = WebhookRequest::new(
                req.headers()
                    .iter()
                    .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v.to_string()))),
                req.body().clone(),
            );
            let resp = app.handle_webhook(&request);
            let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            text(status, &resp.body)
        }
        (&Method::POST, RELOAD_PATH) | (&Method::PUT, RELOAD_PATH) => match app.reload().await {
            Ok(()) => text(StatusCode::OK, "OK"),
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &format!("failed to reload config: {}", e)),
        },
        (&Method::GET, "/") => html(landing_page(telemetry_path)),
        (&Method::GET, "/health") | (&Method::GET, "/healthz") => text(StatusCode::OK, "OK"),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// Collector names given as repeated `collect[]` query parameters
fn collect_filters(uri: &hyper::Uri) -> Vec<String> {
    let Some(query) = uri.query() else {
        return Vec::new();
    };
    let Ok(url) = reqwest::Url::parse(&format!("http://localhost/?{}", query)) else {
        return Vec::new();
    };
    url.query_pairs()
        .filter(|(k, _)| k == COLLECT_PARAM)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
        .collect()
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
    *resp.status_mut() = status;
    resp
}

fn html(body: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    if let Ok(value) = "text/html; charset=utf-8".parse() {
        resp.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    resp
}

fn landing_page(telemetry_path: &str) -> String {
    format!(
        "<html>\n<head><title>Twitch Exporter</title></head>\n<body>\n<h1>Twitch Exporter</h1>\n\
         <p>Version {}</p>\n<p><a href=\"{}\">Metrics</a></p>\n</body>\n</html>\n",
        crate::VERSION,
        telemetry_path
    )
}

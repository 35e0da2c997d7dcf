//! Meshfed validating webhook server.
//!
//! Refuses malformed `Cluster` declarations before the control plane
//! reconciles them.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Response, StatusCode};
use kube::api::ListParams;
use kube::{Api, Client};
use meshfed_operator::crd::Cluster;
use meshfed_operator::validation;
use std::convert::Infallible;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::fs;
use tracing::{error, info, warn};

/// Default webhook server port (HTTPS)
const DEFAULT_WEBHOOK_PORT: u16 = 8443;

/// Default TLS certificate path (mounted by Kubernetes)
const DEFAULT_TLS_CERT_PATH: &str = "/certs/tls.crt";

/// Default TLS private key path (mounted by Kubernetes)
const DEFAULT_TLS_KEY_PATH: &str = "/certs/tls.key";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meshfed_webhook=info".parse()?)
                .add_directive("meshfed_operator=info".parse()?),
        )
        .init();

    info!("Meshfed webhook server starting");

    let port: u16 = env::var("WEBHOOK_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_WEBHOOK_PORT);

    let tls_cert = env::var("TLS_CERT_FILE").unwrap_or_else(|_| DEFAULT_TLS_CERT_PATH.to_string());
    let tls_key = env::var("TLS_KEY_FILE").unwrap_or_else(|_| DEFAULT_TLS_KEY_PATH.to_string());

    info!(
        port = port,
        tls_cert = %tls_cert,
        tls_key = %tls_key,
        "Webhook configuration loaded"
    );

    let cert_pem = fs::read(&tls_cert).await?;
    let key_pem = fs::read(&tls_key).await?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice()).collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or("No private key found in PEM file")?;

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let tls_acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

    let client = Client::try_default().await?;
    let clusters: Api<Cluster> = Api::all(client);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Webhook server listening");

    loop {
        let (stream, _peer_addr) = listener.accept().await?;
        let acceptor = tls_acceptor.clone();
        let clusters = clusters.clone();

        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let service = hyper::service::service_fn(move |req| {
                        let clusters = clusters.clone();
                        async move { handle_request(req, clusters).await }
                    });

                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        error!(error = %e, "Connection error");
                    }
                }
                Err(e) => {
                    error!(error = %e, "TLS handshake failed");
                }
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    clusters: Api<Cluster>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/validate/cluster") => Ok(validate_cluster_request(req, clusters).await),
        (&Method::GET, "/healthz") => Ok(build_response(StatusCode::OK, "OK")),
        (&Method::GET, "/readyz") => Ok(build_response(StatusCode::OK, "Ready")),
        _ => Ok(build_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

#[derive(serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct AdmissionReview {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request: Option<AdmissionRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<AdmissionResponse>,
}

#[derive(serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct AdmissionRequest {
    uid: String,
    operation: String,
    object: Option<Cluster>,
    old_object: Option<Cluster>,
}

#[derive(serde::Deserialize, serde::Serialize)]
struct AdmissionResponse {
    uid: String,
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<AdmissionStatus>,
}

#[derive(serde::Deserialize, serde::Serialize)]
struct AdmissionStatus {
    code: i32,
    message: String,
}

async fn validate_cluster_request(
    req: Request<hyper::body::Incoming>,
    clusters: Api<Cluster>,
) -> Response<Full<Bytes>> {
    let body_bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(error = %e, "Failed to read request body");
            return error_response("Failed to read request body");
        }
    };

    let review: AdmissionReview = match serde_json::from_slice(&body_bytes) {
        Ok(review) => review,
        Err(e) => {
            error!(error = %e, "Failed to parse AdmissionReview");
            return error_response("Invalid AdmissionReview format");
        }
    };

    let Some(request) = review.request else {
        error!("AdmissionReview missing request");
        return error_response("Missing request in AdmissionReview");
    };

    let response = match clusters.list(&ListParams::default()).await {
        Ok(fleet) => review_cluster(&request, &fleet.items),
        Err(e) => {
            error!(error = %e, "Failed to list Clusters");
            deny(request.uid.clone(), 500, format!("failed to list Clusters: {e}"))
        }
    };

    let reply = AdmissionReview {
        api_version: review.api_version,
        kind: review.kind,
        request: None,
        response: Some(response),
    };

    match serde_json::to_string(&reply) {
        Ok(json) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .unwrap_or_else(|e| {
                error!(error = %e, "Failed to build admission review response");
                error_response("Failed to build response")
            }),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            error_response("Failed to serialize response")
        }
    }
}

fn review_cluster(req: &AdmissionRequest, fleet: &[Cluster]) -> AdmissionResponse {
    let name = req
        .object
        .as_ref()
        .or(req.old_object.as_ref())
        .and_then(|c| c.metadata.name.as_deref())
        .unwrap_or("<unnamed>");

    info!(cluster = %name, operation = %req.operation, "Validating Cluster");

    match validation::validate_admission(
        &req.operation,
        req.object.as_ref(),
        req.old_object.as_ref(),
        fleet,
    ) {
        Ok(()) => AdmissionResponse {
            uid: req.uid.clone(),
            allowed: true,
            status: None,
        },
        Err(e) => {
            warn!(cluster = %name, error = %e, "Cluster rejected");
            deny(req.uid.clone(), 403, e.to_string())
        }
    }
}

fn deny(uid: String, code: i32, message: String) -> AdmissionResponse {
    AdmissionResponse {
        uid,
        allowed: false,
        status: Some(AdmissionStatus { code, message }),
    }
}

fn build_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .unwrap_or_else(|e| {
            error!(error = %e, "Failed to build response");
            Response::new(Full::new(Bytes::from("Internal Error")))
        })
}

fn error_response(message: &str) -> Response<Full<Bytes>> {
    build_response(StatusCode::BAD_REQUEST, message.to_string())
}

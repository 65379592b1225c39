use crate::context::OpContext;
use crate::volume::api::*;
use crate::volume::driver::VolumeDriver;
use crate::volume::error::PluginError;

use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PluginRoute {
    Activate,
    Capabilities,
    Create,
    Get,
    List,
    Mount,
    Path,
    Remove,
    Unmount,
}

impl PluginRoute {
    fn from_path(path: &str) -> Option<Self> {
        match path {
            "/Plugin.Activate" => Some(Self::Activate),
            "/VolumeDriver.Capabilities" => Some(Self::Capabilities),
            "/VolumeDriver.Create" => Some(Self::Create),
            "/VolumeDriver.Get" => Some(Self::Get),
            "/VolumeDriver.List" => Some(Self::List),
            "/VolumeDriver.Mount" => Some(Self::Mount),
            "/VolumeDriver.Path" => Some(Self::Path),
            "/VolumeDriver.Remove" => Some(Self::Remove),
            "/VolumeDriver.Unmount" => Some(Self::Unmount),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct DockerPluginService {
    driver: Arc<dyn VolumeDriver>,
}

impl DockerPluginService {
    pub fn new(driver: Arc<dyn VolumeDriver>) -> Self {
        Self { driver }
    }

    /// Dispatches one request. Generic over the body so tests can drive it
    /// without a socket.
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, PluginError>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let path = req.uri().path().to_string();
        info!(method = ?req.method(), path = %path, "received request");

        let Some(route) = PluginRoute::from_path(&path) else {
            let mut not_found = Response::new(Full::default());
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            return Ok(not_found);
        };

        // Cancelled if the caller goes away mid-request, which kills any
        // mount command still running for it.
        let ctx = OpContext::background();
        let _guard = ctx.drop_guard();

        match route {
            PluginRoute::Activate => Ok(json_ok(&PluginActivateResponse {
                implements: vec!["VolumeDriver".to_string()],
            })),
            PluginRoute::Capabilities => Ok(json_ok(&CapabilitiesResponse {
                capabilities: Capabilities {
                    scope: "local".into(),
                },
            })),
            PluginRoute::Create => {
                let req: CreateRequest = decode(req).await?;
                self.driver
                    .create(&req.name, req.opts.unwrap_or_default())
                    .await?;
                Ok(json_ok(&Reply::ok(Empty {})))
            }
            PluginRoute::Remove => {
                let req: NameRequest = decode(req).await?;
                self.driver.remove(&ctx, &req.name).await?;
                Ok(json_ok(&Reply::ok(Empty {})))
            }
            PluginRoute::Mount => {
                let req: MountRequest = decode(req).await?;
                debug!(volume = %req.name, id = %req.id, "mount requested");
                let path = self.driver.mount(&ctx, &req.name).await?;
                Ok(json_ok(&Reply::ok(MountResponse {
                    mountpoint: path.to_string_lossy().to_string(),
                })))
            }
            PluginRoute::Unmount => {
                let req: MountRequest = decode(req).await?;
                debug!(volume = %req.name, id = %req.id, "unmount requested");
                self.driver.unmount(&ctx, &req.name).await?;
                Ok(json_ok(&Reply::ok(Empty {})))
            }
            PluginRoute::Path => {
                let req: NameRequest = decode(req).await?;
                let path = self.driver.path(&req.name).await?;
                Ok(json_ok(&Reply::ok(MountResponse {
                    mountpoint: path.to_string_lossy().to_string(),
                })))
            }
            PluginRoute::Get => {
                let req: NameRequest = decode(req).await?;
                let volume = self.driver.get(&req.name).await?;
                Ok(json_ok(&Reply::ok(GetResponse { volume })))
            }
            PluginRoute::List => {
                let volumes = self.driver.list().await;
                Ok(json_ok(&Reply::ok(ListResponse { volumes })))
            }
        }
    }
}

impl<B> Service<Request<B>> for DockerPluginService
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: std::fmt::Display,
{
    type Response = Response<Full<Bytes>>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let svc = self.clone();
        Box::pin(async move {
            match svc.handle(req).await {
                Ok(resp) => Ok(resp),
                Err(e) => Ok(e.into_response()),
            }
        })
    }
}

async fn decode<T, B>(req: Request<B>) -> Result<T, PluginError>
where
    T: serde::de::DeserializeOwned,
    B: Body,
    B::Error: std::fmt::Display,
{
    let body_bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| PluginError::Internal(e.to_string()))?
        .to_bytes();
    // Some callers send no body at all for name-less requests.
    if body_bytes.is_empty() {
        return serde_json::from_slice(b"{}").map_err(PluginError::Json);
    }
    serde_json::from_slice(&body_bytes).map_err(PluginError::Json)
}

fn json_ok<T: Serialize>(data: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(data) {
        Ok(json) => {
            let mut response = Response::new(Full::new(Bytes::from(json)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => PluginError::Json(e).into_response(),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PluginActivateResponse {
    implements: Vec<String>,
}

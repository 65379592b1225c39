use crate::mounter::MountError;
use http_body_util::Full;
use hyper::{Response, StatusCode, body::Bytes};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Missing mandatory 'volume_name'")]
    MissingName,

    #[error("Missing mandatory '{0}' field in 'Opts'")]
    MissingRequiredOpt(&'static str),

    #[error("invalid volume name: {0}")]
    InvalidName(String),

    #[error("Volume '{0}' must be created before being mounted")]
    NotCreated(String),

    #[error("Volume '{0}' not found")]
    NotFound(String),

    /// Returned by `Get`, whose callers match on this exact text.
    #[error("volume not found")]
    UnknownVolume,

    #[error("volume not previously mounted")]
    NotMounted,

    #[error("Volume {name} does not exist (path: {path})")]
    MountpointMissing { name: String, path: String },

    #[error("Volume {name} does not exist (path: {path}) and unable to remove mount directory: {source}")]
    MountpointCleanup {
        name: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error("Error unmounting volume: {0}")]
    Unmount(#[source] MountError),

    #[error("Error creating mountpoint {path:?}: {source}")]
    MountDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error removing mountpoint {path:?}: {source}")]
    MountDirRemoval {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}", persist_message(.op, .source))]
    Persist {
        op: PersistOp,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot prepare mount root {path:?}: {source}")]
    Setup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// The mutation whose state write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOp {
    Creating,
    Mounting,
    Unmounting,
    Removing,
}

impl PersistOp {
    fn as_str(self) -> &'static str {
        match self {
            PersistOp::Creating => "creating",
            PersistOp::Mounting => "mounting",
            PersistOp::Unmounting => "unmounting",
            PersistOp::Removing => "removing",
        }
    }
}

impl std::fmt::Display for PersistOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Callers match on these exact prefixes, which differ by operation.
fn persist_message(op: &PersistOp, source: &std::io::Error) -> String {
    match op {
        PersistOp::Creating | PersistOp::Mounting => {
            format!("persist state failed when {op}: {source}")
        }
        PersistOp::Unmounting | PersistOp::Removing => {
            format!("failed to persist state when {op}: {source}")
        }
    }
}

#[derive(Serialize)]
struct DockerErrorResponse {
    #[serde(rename = "Err")]
    err: String,
}

impl PluginError {
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let err_msg = self.to_string();

        tracing::error!(error = %err_msg, "plugin request failed");

        let body = DockerErrorResponse { err: err_msg };
        let json = serde_json::to_vec(&body)
            .unwrap_or_else(|_| b"{\"Err\":\"Internal Serialization Error\"}".to_vec());

        let mut response = Response::new(Full::new(Bytes::from(json)));
        *response.status_mut() = StatusCode::OK;
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );
        response
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    convert::Infallible,
    fs::{create_dir_all, remove_file},
    path::Path,
    sync::Arc,
};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::{
    body::Incoming,
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::{net::UnixListener, task::spawn_blocking};

use crate::{
    engine::VolumeEngine,
    jsonrpc::{
        consts::{MAX_MESSAGE_SIZE, PLUGIN_CONTENT_TYPE},
        interface::{RbdVolRequest, RbdVolResponse},
    },
    rbdvol::{RbdVolError, RbdVolResult},
};

fn respond(status: StatusCode, response: &RbdVolResponse) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(response).unwrap_or_else(|e| {
        error!("Failed to serialize response {:?}: {}", response, e);
        Vec::new()
    });
    let mut http_response = Response::new(Full::new(Bytes::from(body)));
    *http_response.status_mut() = status;
    http_response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(PLUGIN_CONTENT_TYPE));
    http_response
}

fn reject(status: StatusCode, msg: String) -> Response<Full<Bytes>> {
    warn!("Rejecting request: {}", msg);
    respond(status, &RbdVolResponse::err(&RbdVolError::Msg(msg)))
}

// Answer one request. Failures of the operation itself are reported in
// `Err` with a 500 status, which is what Docker expects of a plugin.
async fn handle_request(
    engine: Arc<VolumeEngine>,
    request: Request<Incoming>,
) -> RbdVolResult<Response<Full<Bytes>>> {
    if *request.method() != Method::POST {
        return Ok(reject(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Method {} is not supported", request.method()),
        ));
    }
    let endpoint = request.uri().path().to_string();
    let body = match Limited::new(request.into_body(), MAX_MESSAGE_SIZE)
        .collect()
        .await
    {
        Ok(body) => body.to_bytes(),
        Err(e) => {
            return Ok(reject(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Failed to read request to {endpoint}: {e}"),
            ))
        }
    };

    let request = match RbdVolRequest::parse(&endpoint, &body) {
        Some(Ok(request)) => request,
        Some(Err(e)) => {
            return Ok(reject(
                StatusCode::BAD_REQUEST,
                format!("Malformed request to {endpoint}: {e}"),
            ))
        }
        None => {
            return Ok(reject(
                StatusCode::NOT_FOUND,
                format!("No handler for {endpoint}"),
            ))
        }
    };

    debug!("Received request {:?}", request);
    let description = format!("{request:?}");
    let response = spawn_blocking(move || request.process(&engine)).await?;
    if response.err.is_empty() {
        Ok(respond(StatusCode::OK, &response))
    } else {
        error!("Request {} failed: {}", description, response.err);
        Ok(respond(StatusCode::INTERNAL_SERVER_ERROR, &response))
    }
}

async fn serve(
    engine: Arc<VolumeEngine>,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(handle_request(engine, request).await.unwrap_or_else(|e| {
        error!("Failed to handle request: {}", e);
        respond(StatusCode::INTERNAL_SERVER_ERROR, &RbdVolResponse::err(&e))
    }))
}

pub struct RbdVolServer {
    engine: Arc<VolumeEngine>,
    listener: UnixListener,
}

impl RbdVolServer {
    /// Bind the socket at path, replacing a socket left by an earlier run.
    /// Must be called from within a tokio runtime.
    pub fn new<P>(engine: Arc<VolumeEngine>, path: P) -> RbdVolResult<RbdVolServer>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        if path.exists() {
            remove_file(path).map_err(|e| {
                RbdVolError::Chained(
                    format!("Failed to remove stale socket {}", path.display()),
                    Box::new(RbdVolError::from(e)),
                )
            })?;
        }
        let listener = UnixListener::bind(path).map_err(|e| {
            RbdVolError::Chained(
                format!("Failed to bind socket {}", path.display()),
                Box::new(RbdVolError::from(e)),
            )
        })?;
        info!("Listening for requests on {}", path.display());
        Ok(RbdVolServer { engine, listener })
    }

    /// Accept connections forever, each served in its own task. A
    /// connection may carry any number of requests.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let engine = Arc::clone(&self.engine);
                    tokio::spawn(async move {
                        let service = service_fn(move |request| serve(Arc::clone(&engine), request));
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            if !(e.is_closed() || e.is_incomplete_message()) {
                                warn!("Failed to serve connection: {}", e);
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!("Encountered an error while accepting a connection: {}", e);
                }
            }
        }
    }
}

pub async fn run_server<P>(engine: Arc<VolumeEngine>, path: P) -> RbdVolResult<()>
where
    P: AsRef<Path>,
{
    RbdVolServer::new(engine, path)?.run().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::UnixStream,
        task::JoinHandle,
    };

    use crate::{
        engine::{DriverConfig, SimBackend, ToolPaths},
        jsonrpc::client::RbdVolClient,
    };

    use super::*;

    struct TestServer {
        engine: Arc<VolumeEngine>,
        socket: PathBuf,
        handle: JoinHandle<()>,
        dir: TempDir,
    }

    fn start_server() -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("run").join("rbd.sock");
        let engine = Arc::new(VolumeEngine::new(
            DriverConfig {
                volume_root: dir.path().join("volumes"),
                default_pool: "rbd".to_string(),
                default_fs_type: "xfs".to_string(),
                default_size_mb: 16,
                tool_paths: ToolPaths::default(),
            },
            Arc::new(SimBackend::default()),
        ));
        // A leftover file at the socket path is replaced.
        create_dir_all(socket.parent().unwrap()).unwrap();
        std::fs::write(&socket, b"").unwrap();

        let server = RbdVolServer::new(Arc::clone(&engine), &socket).unwrap();
        let handle = tokio::spawn(server.run());
        TestServer {
            engine,
            socket,
            handle,
            dir,
        }
    }

    // Send a hand written HTTP request the way Docker does, without
    // shutting down the write half, and return the raw answer.
    async fn raw_request(socket: &Path, endpoint: &str, body: &str) -> String {
        let mut stream = UnixStream::connect(socket).await.unwrap();
        let request = format!(
            "POST {endpoint} HTTP/1.1\r\nHost: plugin\r\nContent-Type: {PLUGIN_CONTENT_TYPE}\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut answer = String::new();
        stream.read_to_string(&mut answer).await.unwrap();
        answer
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_round_trip() {
        let server = start_server();
        let mut client = RbdVolClient::connect(&server.socket).await.unwrap();

        let response = client.request(&RbdVolRequest::Activate).await.unwrap();
        assert_eq!(response.implements, Some(vec!["VolumeDriver".to_string()]));

        client
            .request(&RbdVolRequest::volume(RbdVolRequest::Create, "vol"))
            .await
            .unwrap()
            .into_result()
            .unwrap();
        let response = client
            .request(&RbdVolRequest::volume(RbdVolRequest::Mount, "vol"))
            .await
            .unwrap();
        assert_eq!(
            response.mountpoint,
            Some(server.dir.path().join("volumes/rbd/vol"))
        );

        let response = client
            .request(&RbdVolRequest::volume(RbdVolRequest::Mount, "vol"))
            .await
            .unwrap();
        assert!(response.err.contains("LockError"));

        server.handle.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_docker_requests() {
        let server = start_server();

        let answer = raw_request(&server.socket, "/Plugin.Activate", "").await;
        assert!(answer.starts_with("HTTP/1.1 200"));
        assert!(answer.ends_with(r#"{"Implements":["VolumeDriver"],"Err":""}"#));

        let answer = raw_request(
            &server.socket,
            "/VolumeDriver.Path",
            r#"{"Name":"ssd/db","Opts":null}"#,
        )
        .await;
        assert!(answer.starts_with("HTTP/1.1 200"));
        assert!(answer.contains("volumes/ssd/db"));

        let answer = raw_request(&server.socket, "/VolumeDriver.Mount", r#"{"Name":"/bad"}"#).await;
        assert!(answer.starts_with("HTTP/1.1 500"));
        assert!(answer.contains("ParseError"));

        let answer = raw_request(&server.socket, "/VolumeDriver.Capabilities", "{}").await;
        assert!(answer.starts_with("HTTP/1.1 404"));

        let answer = raw_request(&server.socket, "/VolumeDriver.Mount", "{").await;
        assert!(answer.starts_with("HTTP/1.1 400"));

        server.handle.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    /// A report larger than any request is delivered whole.
    async fn test_large_report() {
        let server = start_server();
        for i in 0..400 {
            let name = format!("volume-{i:04}-in-a-report-too-large-for-one-request");
            server.engine.create(&name).unwrap();
            server.engine.mount(&name).unwrap();
        }

        let mut client = RbdVolClient::connect(&server.socket).await.unwrap();
        let report = client
            .request(&RbdVolRequest::Report)
            .await
            .unwrap()
            .report
            .unwrap();
        assert_eq!(report["volumes"].as_array().unwrap().len(), 400);
        assert!(serde_json::to_vec(&report).unwrap().len() > MAX_MESSAGE_SIZE);

        server.handle.abort();
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::Path;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    client::conn::http1::{self, SendRequest},
    header::{HeaderValue, CONTENT_TYPE, HOST},
    Method, Request, Uri,
};
use hyper_util::rt::TokioIo;
use tokio::{net::UnixStream, runtime::Builder};

use crate::{
    jsonrpc::{
        consts::PLUGIN_CONTENT_TYPE,
        interface::{RbdVolRequest, RbdVolResponse},
    },
    rbdvol::{RbdVolError, RbdVolResult},
};

/// A connection to the daemon. Requests on it are answered in order.
pub struct RbdVolClient(SendRequest<Full<Bytes>>);

impl RbdVolClient {
    /// Must be called from within a tokio runtime.
    pub async fn connect<P>(path: P) -> RbdVolResult<RbdVolClient>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await.map_err(|e| {
            RbdVolError::Chained(
                format!("Failed to connect to the daemon at {}", path.display()),
                Box::new(RbdVolError::from(e)),
            )
        })?;
        let (sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Connection to the daemon closed: {}", e);
            }
        });
        Ok(RbdVolClient(sender))
    }

    /// Send the request and wait for the whole response.
    pub async fn request(&mut self, request: &RbdVolRequest) -> RbdVolResult<RbdVolResponse> {
        let mut http_request = Request::new(Full::new(Bytes::from(request.body()?)));
        *http_request.method_mut() = Method::POST;
        *http_request.uri_mut() = Uri::from_static(request.endpoint());
        let headers = http_request.headers_mut();
        headers.insert(HOST, HeaderValue::from_static("localhost"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(PLUGIN_CONTENT_TYPE));

        let response = self.0.send_request(http_request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        match serde_json::from_slice::<RbdVolResponse>(&body) {
            Ok(response) => Ok(response),
            Err(_) if !status.is_success() => Err(RbdVolError::Msg(format!(
                "Daemon answered {} with status {}",
                request.endpoint(),
                status
            ))),
            Err(e) => Err(RbdVolError::from(e)),
        }
    }
}

/// Issue a request to the daemon listening at path, blocking until it is
/// answered. A response that carries an error message is returned as an
/// error.
pub fn request<P>(path: P, request: RbdVolRequest) -> RbdVolResult<RbdVolResponse>
where
    P: AsRef<Path>,
{
    let runtime = Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(async {
        RbdVolClient::connect(path)
            .await?
            .request(&request)
            .await?
            .into_result()
    })
}

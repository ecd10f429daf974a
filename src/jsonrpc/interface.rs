// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    engine::VolumeEngine,
    jsonrpc::consts::VOLUME_DRIVER,
    rbdvol::{RbdVolError, RbdVolResult},
};

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct VolumeName {
    #[serde(rename = "Name")]
    pub name: String,
}

/// A single request. Each is a POST to its own endpoint; volume requests
/// carry a `{"Name": ..}` body as in the Docker volume plugin protocol.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RbdVolRequest {
    Activate,
    Create(VolumeName),
    Remove(VolumeName),
    Path(VolumeName),
    Mount(VolumeName),
    Unmount(VolumeName),
    Report,
}

impl RbdVolRequest {
    pub fn volume<S>(make: fn(VolumeName) -> RbdVolRequest, name: S) -> RbdVolRequest
    where
        S: Into<String>,
    {
        make(VolumeName { name: name.into() })
    }

    pub fn endpoint(&self) -> &'static str {
        match self {
            RbdVolRequest::Activate => "/Plugin.Activate",
            RbdVolRequest::Create(_) => "/VolumeDriver.Create",
            RbdVolRequest::Remove(_) => "/VolumeDriver.Remove",
            RbdVolRequest::Path(_) => "/VolumeDriver.Path",
            RbdVolRequest::Mount(_) => "/VolumeDriver.Mount",
            RbdVolRequest::Unmount(_) => "/VolumeDriver.Unmount",
            RbdVolRequest::Report => "/RbdVol.Report",
        }
    }

    pub fn body(&self) -> RbdVolResult<Vec<u8>> {
        match self {
            RbdVolRequest::Activate | RbdVolRequest::Report => Ok(b"{}".to_vec()),
            RbdVolRequest::Create(name)
            | RbdVolRequest::Remove(name)
            | RbdVolRequest::Path(name)
            | RbdVolRequest::Mount(name)
            | RbdVolRequest::Unmount(name) => Ok(serde_json::to_vec(name)?),
        }
    }

    /// Decode a request posted to endpoint. Returns None if nothing is
    /// served there. Fields of the body other than `Name` are ignored.
    pub fn parse(endpoint: &str, body: &[u8]) -> Option<RbdVolResult<RbdVolRequest>> {
        let make: fn(VolumeName) -> RbdVolRequest = match endpoint {
            "/Plugin.Activate" => return Some(Ok(RbdVolRequest::Activate)),
            "/RbdVol.Report" => return Some(Ok(RbdVolRequest::Report)),
            "/VolumeDriver.Create" => RbdVolRequest::Create,
            "/VolumeDriver.Remove" => RbdVolRequest::Remove,
            "/VolumeDriver.Path" => RbdVolRequest::Path,
            "/VolumeDriver.Mount" => RbdVolRequest::Mount,
            "/VolumeDriver.Unmount" => RbdVolRequest::Unmount,
            _ => return None,
        };
        Some(
            serde_json::from_slice::<VolumeName>(body)
                .map(make)
                .map_err(RbdVolError::from),
        )
    }

    /// Run the request against the engine. Blocks until every backend
    /// command it needs has completed.
    pub fn process(self, engine: &VolumeEngine) -> RbdVolResponse {
        let res = match self {
            RbdVolRequest::Activate => Ok(RbdVolResponse {
                implements: Some(vec![VOLUME_DRIVER.to_string()]),
                ..Default::default()
            }),
            RbdVolRequest::Create(VolumeName { name }) => {
                engine.create(&name).map(|_| RbdVolResponse::default())
            }
            RbdVolRequest::Remove(VolumeName { name }) => {
                engine.remove(&name).map(|_| RbdVolResponse::default())
            }
            RbdVolRequest::Path(VolumeName { name }) => {
                engine.path(&name).map(RbdVolResponse::mountpoint)
            }
            RbdVolRequest::Mount(VolumeName { name }) => {
                engine.mount(&name).map(RbdVolResponse::mountpoint)
            }
            RbdVolRequest::Unmount(VolumeName { name }) => {
                engine.unmount(&name).map(|_| RbdVolResponse::default())
            }
            RbdVolRequest::Report => Ok(RbdVolResponse {
                report: Some(engine.report()),
                ..Default::default()
            }),
        };
        res.unwrap_or_else(|e| RbdVolResponse::err(&e))
    }
}

/// The answer to a request. `Err` is empty exactly when the request
/// succeeded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RbdVolResponse {
    #[serde(
        rename = "Implements",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub implements: Option<Vec<String>>,
    #[serde(
        rename = "Mountpoint",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub mountpoint: Option<PathBuf>,
    #[serde(rename = "Report", default, skip_serializing_if = "Option::is_none")]
    pub report: Option<Value>,
    #[serde(rename = "Err", default)]
    pub err: String,
}

impl RbdVolResponse {
    pub fn mountpoint(mountpoint: PathBuf) -> RbdVolResponse {
        RbdVolResponse {
            mountpoint: Some(mountpoint),
            ..Default::default()
        }
    }

    pub fn err(err: &RbdVolError) -> RbdVolResponse {
        RbdVolResponse {
            err: err.to_string(),
            ..Default::default()
        }
    }

    /// Convert a failure response back into an error.
    pub fn into_result(self) -> RbdVolResult<RbdVolResponse> {
        if self.err.is_empty() {
            Ok(self)
        } else {
            Err(RbdVolError::Msg(self.err))
        }
    }
}

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cloudsync_core::config::PublicResourcePolicy;
use cloudsync_core::types::{ResourceType, Vendor};
use cloudsync_sync::{ConditionalSyncRequest, ErrorClass, SyncError};

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// JSON newline-delimited request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<Vendor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<ResourceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ConditionalSyncRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_public_resource: Option<PublicResourcePolicy>,
}

impl DaemonRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            class: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            class: Some(ErrorClass::Invalid),
        }
    }

    pub fn from_sync_error(err: &SyncError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(err.to_string()),
            class: Some(err.class()),
        }
    }
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("status");

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::new("stop"))?;
    response_into_data(response).map(|_| ())
}

/// Run a full account sync in the daemon and wait for its report.
pub fn request_sync_account(
    home: &Path,
    account: &str,
    policy: Option<PublicResourcePolicy>,
) -> Result<Value, DaemonError> {
    let response = send_request(
        home,
        &DaemonRequest {
            account: Some(account.to_string()),
            sync_public_resource: policy,
            ..DaemonRequest::new("sync_account")
        },
    )?;
    response_into_data(response)
}

/// Start a conditional sync; returns as soon as the daemon has started it.
pub fn request_sync_resource(
    home: &Path,
    account: &str,
    vendor: Vendor,
    resource_type: ResourceType,
    request: ConditionalSyncRequest,
) -> Result<Value, DaemonError> {
    let response = send_request(
        home,
        &DaemonRequest {
            account: Some(account.to_string()),
            vendor: Some(vendor),
            resource_type: Some(resource_type),
            request: Some(request),
            ..DaemonRequest::new("sync_resource")
        },
    )?;
    response_into_data(response)
}

pub fn request_sync_status(
    home: &Path,
    account: &str,
    vendor: Option<Vendor>,
) -> Result<Value, DaemonError> {
    let response = send_request(
        home,
        &DaemonRequest {
            account: Some(account.to_string()),
            vendor,
            ..DaemonRequest::new("sync_status")
        },
    )?;
    response_into_data(response)
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Rejected {
            class: response.class,
            message: response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_omits_unset_fields() {
        let encoded = serde_json::to_string(&DaemonRequest::new("status")).unwrap();
        assert_eq!(encoded, r#"{"cmd":"status"}"#);
    }

    #[test]
    fn sync_resource_request_roundtrips_from_wire_json() {
        let line = r#"{"cmd":"sync_resource","account":"acct-1","vendor":"tcloud","resource_type":"subnet","request":{"regions":["r1"],"tag_filters":{"env":["prod"]}}}"#;
        let request: DaemonRequest = serde_json::from_str(line).unwrap();
        assert_eq!(request.vendor, Some(Vendor::TCloud));
        assert_eq!(request.resource_type, Some(ResourceType::Subnet));
        let body = request.request.unwrap();
        assert_eq!(body.regions, vec!["r1".to_string()]);
        assert!(body.cloud_ids.is_empty());
    }

    #[test]
    fn rejected_response_keeps_class() {
        let response = DaemonResponse::from_sync_error(&SyncError::InProgress);
        let err = response_into_data(response).unwrap_err();
        assert_eq!(err.class(), Some(ErrorClass::Conflict));
        assert_eq!(err.to_string(), "synchronization is in progress");

        let ok = response_into_data(DaemonResponse::ok(json!({"status": "started"}))).unwrap();
        assert_eq!(ok["status"], "started");
    }
}

//! The resource container protocol.
//!
//! A resource type is a plugin image carrying three scripts:
//! `/opt/resource/check` enumerates versions newest-first,
//! `/opt/resource/in` fetches one, `/opt/resource/out` publishes one.
//! Each takes a JSON request on stdin and replies with JSON on stdout.

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use conveyor_core::version::MetadataField;
use conveyor_core::{Result, Version};
use conveyor_worker::{Container, ProcessIo, ProcessSpec};

use crate::cancel::with_cancel;

pub const CHECK_SCRIPT: &str = "/opt/resource/check";
pub const IN_SCRIPT: &str = "/opt/resource/in";
pub const OUT_SCRIPT: &str = "/opt/resource/out";

/// Directory a get deposits its artifact into, and an out reads from.
pub const RESOURCE_RESULT_PATH: &str = "/tmp/build/get";
pub const RESOURCE_PUT_PATH: &str = "/tmp/build/put";

/// Image a resource type's containers boot from. Workers advertising a
/// type are expected to be able to pull its plugin image.
pub fn resource_image(resource_type: &str) -> String {
    format!("conveyor/{}-resource", resource_type)
}

/// Reply of an `in` or `out` script.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionResult {
    pub version: Version,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

pub(crate) struct ScriptResult {
    pub exit_status: i32,
    pub stdout: Vec<u8>,
}

/// Runs a resource script to completion, capturing stdout. Cancellation
/// stops the container gracefully and surfaces `Interrupted`.
pub(crate) async fn run_script(
    container: &Container,
    cancel: &CancellationToken,
    path: &str,
    args: Vec<String>,
    request: &serde_json::Value,
    stderr: Option<mpsc::Sender<Bytes>>,
) -> Result<ScriptResult> {
    let (stdout_tx, mut stdout_rx) = mpsc::channel::<Bytes>(16);

    let spec = ProcessSpec {
        path: path.to_string(),
        args,
        env: vec![],
        dir: None,
        user: Some("root".to_string()),
        tty: false,
        stdin: Some(Bytes::from(serde_json::to_vec(request)?)),
    };
    let io = ProcessIo {
        stdout: Some(stdout_tx),
        stderr,
    };

    let mut process = with_cancel(cancel, container.run(spec, io)).await??;

    let collector = tokio::spawn(async move {
        let mut stdout = Vec::new();
        while let Some(chunk) = stdout_rx.recv().await {
            stdout.extend_from_slice(&chunk);
        }
        stdout
    });

    let exit_status = match with_cancel(cancel, process.wait()).await {
        Ok(result) => result?,
        Err(err) => {
            let _ = container.stop(false).await;
            return Err(err);
        }
    };

    let stdout = collector.await.unwrap_or_default();
    Ok(ScriptResult {
        exit_status,
        stdout,
    })
}

/// Parses a check script's reply: versions, newest first.
pub(crate) fn parse_versions(stdout: &[u8]) -> Result<Vec<Version>> {
    Ok(serde_json::from_slice(stdout)?)
}

/// Parses an in/out script's reply.
pub(crate) fn parse_version_result(stdout: &[u8]) -> Result<VersionResult> {
    Ok(serde_json::from_slice(stdout)?)
}

//! Task configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Configuration of one task step: which image to run on, what it reads,
/// what it produces, and the script to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub platform: Option<String>,
    /// Literal rootfs image reference. Mutually exclusive with
    /// `image_resource`; when both are set the resource wins.
    pub image: Option<String>,
    pub image_resource: Option<ImageResource>,
    #[serde(default)]
    pub inputs: Vec<TaskInput>,
    #[serde(default)]
    pub outputs: Vec<TaskOutput>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub run: RunConfig,
}

impl TaskConfig {
    /// Flattens params to the `K=V` form handed to the process.
    pub fn env(&self) -> Vec<String> {
        self.params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// A versioned resource whose fetched volume becomes the task's rootfs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub source: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub name: String,
    pub path: Option<String>,
}

impl TaskInput {
    /// Directory under the artifacts root this input lands in.
    pub fn subdir(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub name: String,
    pub path: Option<String>,
}

impl TaskOutput {
    pub fn subdir(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}

/// The script a task runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

//! Per-workspace metadata sidecar at `<ws>/.gion/metadata.json`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::git::GionError;

pub const METADATA_DIR_NAME: &str = ".gion";
const METADATA_FILE_NAME: &str = "metadata.json";

/// How a workspace came to be.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WorkspaceMode {
    Preset,
    Repo,
    Review,
    Issue,
    Resume,
    Add,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WorkspaceMode>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preset_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_url: String,
    /// `origin/<branch>` the workspace's new branches were cut from.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_branch: String,
}

impl Metadata {
    pub fn with_description(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    fn normalized(&self) -> Self {
        Self {
            description: self.description.trim().to_string(),
            mode: self.mode,
            preset_name: self.preset_name.trim().to_string(),
            source_url: self.source_url.trim().to_string(),
            base_branch: self.base_branch.trim().to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.normalized() == Metadata::default()
    }

    pub fn validate(&self) -> Result<(), GionError> {
        let meta = self.normalized();
        let invalid = |msg: String| GionError::InvalidMetadata(msg);

        if meta.mode == Some(WorkspaceMode::Preset) && meta.preset_name.is_empty() {
            return Err(invalid("preset_name is required for preset mode".into()));
        }
        if !meta.source_url.is_empty() && !is_absolute_url(&meta.source_url) {
            return Err(invalid(format!("invalid source_url: {}", meta.source_url)));
        }
        if !meta.base_branch.is_empty() {
            if meta.base_branch.contains(char::is_whitespace) {
                return Err(invalid(format!("invalid base_branch: {}", meta.base_branch)));
            }
            match meta.base_branch.strip_prefix("origin/") {
                Some(branch) if !branch.is_empty() => {}
                _ => {
                    return Err(invalid(format!(
                        "invalid base_branch (must be origin/<branch>): {}",
                        meta.base_branch
                    )));
                }
            }
        }
        Ok(())
    }
}

pub fn metadata_path(ws_dir: &Path) -> PathBuf {
    ws_dir.join(METADATA_DIR_NAME).join(METADATA_FILE_NAME)
}

/// Read the sidecar; a missing file is empty metadata.
pub fn load(ws_dir: &Path) -> anyhow::Result<Metadata> {
    let path = metadata_path(ws_dir);
    let data = match std::fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Metadata::default()),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
}

/// Validate and write the sidecar. Nothing is written when every field is
/// empty.
pub fn save(ws_dir: &Path, meta: &Metadata) -> anyhow::Result<()> {
    let meta = meta.normalized();
    if meta == Metadata::default() {
        return Ok(());
    }
    meta.validate()?;

    let dir = ws_dir.join(METADATA_DIR_NAME);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let data = serde_json::to_string_pretty(&meta)?;
    let path = metadata_path(ws_dir);
    std::fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))
}

/// `scheme://host...` with a letter-led scheme and a non-empty host.
fn is_absolute_url(value: &str) -> bool {
    let Some((scheme, rest)) = value.split_once("://") else {
        return false;
    };
    let scheme_ok = scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    scheme_ok && !host.is_empty() && !value.contains(char::is_whitespace)
}

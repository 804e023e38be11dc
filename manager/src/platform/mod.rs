//! Deployment targets

pub mod casaos;

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::storage::settings::DeploymentTargetSetting;

/// Platform style compose documents are deployed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentTarget {
    /// Containers are created directly from the transformed document
    Standalone,
    /// Compose-up plus registry processing for the CasaOS app registry
    Casaos,
}

impl DeploymentTarget {
    /// Resolve the configured target; `auto` checks for the metadata root
    pub async fn resolve(setting: DeploymentTargetSetting, metadata_root: &Path) -> Self {
        let target = match setting {
            DeploymentTargetSetting::Standalone => DeploymentTarget::Standalone,
            DeploymentTargetSetting::Casaos => DeploymentTarget::Casaos,
            DeploymentTargetSetting::Auto => {
                let present = tokio::fs::metadata(metadata_root)
                    .await
                    .map(|m| m.is_dir())
                    .unwrap_or(false);
                if present {
                    DeploymentTarget::Casaos
                } else {
                    DeploymentTarget::Standalone
                }
            }
        };
        info!("Deployment target: {}", target.as_str());
        target
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentTarget::Standalone => "standalone",
            DeploymentTarget::Casaos => "casaos",
        }
    }

    /// Whether registry processing runs around deploys
    pub fn uses_registry(&self) -> bool {
        matches!(self, DeploymentTarget::Casaos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_resolution() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            DeploymentTarget::resolve(DeploymentTargetSetting::Auto, dir.path()).await,
            DeploymentTarget::Casaos
        );
        assert_eq!(
            DeploymentTarget::resolve(DeploymentTargetSetting::Auto, &dir.path().join("missing"))
                .await,
            DeploymentTarget::Standalone
        );
        assert_eq!(
            DeploymentTarget::resolve(DeploymentTargetSetting::Standalone, dir.path()).await,
            DeploymentTarget::Standalone
        );
    }
}

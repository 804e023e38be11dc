//! Registry processing for the CasaOS app platform
//!
//! Side effects layered around a deploy so the platform's own app registry
//! sees and can manage each bot. Everything here is best-effort except the
//! pre-install hook.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::buildlog::BuildLog;
use crate::compose::document::ComposeDocument;
use crate::deploy::process::{run_command, CommandSpec};
use crate::errors::BotError;
use crate::filesys::dir::Dir;
use crate::storage::layout::COMPOSE_FILE_NAME;
use crate::storage::settings::{PlatformSettings, TimeoutSettings};

/// Metadata keys of the optional install hooks
pub const PRE_INSTALL_KEY: &str = "pre-install-cmd";
pub const POST_INSTALL_KEY: &str = "post-install-cmd";

/// Platform-side provisioning, metadata placement and hooks
#[derive(Debug, Clone)]
pub struct RegistryProcessor {
    platform: PlatformSettings,
    timeouts: TimeoutSettings,
}

impl RegistryProcessor {
    pub fn new(platform: PlatformSettings, timeouts: TimeoutSettings) -> Self {
        Self { platform, timeouts }
    }

    /// Directory the platform reads an app's compose document from
    pub fn metadata_dir(&self, app_id: &str) -> Dir {
        Dir::new(self.platform.metadata_root.join(app_id))
    }

    /// Host data directory of an app
    pub fn app_data_dir(&self, app_id: &str) -> Dir {
        Dir::new(self.platform.data_root.join(app_id))
    }

    async fn chown(&self, dir: &Dir, log: &BuildLog) {
        if let Err(e) = dir
            .chown_recursive(self.platform.puid, self.platform.pgid)
            .await
        {
            log.warning(format!(
                "Could not set ownership of {}: {}",
                dir.path().display(),
                e
            ));
        }
    }

    /// Bind-mount sources under the data root referenced by `document`
    pub fn bind_mount_dirs(&self, document: &ComposeDocument) -> Result<Vec<PathBuf>, BotError> {
        let mut dirs = Vec::new();
        for spec in document.service_specs()? {
            for volume in spec.volumes.iter().filter(|v| v.is_bind()) {
                let Some(source) = volume.source() else {
                    continue;
                };
                let path = PathBuf::from(source);
                if path.starts_with(&self.platform.data_root) && !dirs.contains(&path) {
                    dirs.push(path);
                }
            }
        }
        Ok(dirs)
    }

    /// Create every referenced bind-mount directory and hand it to PUID/PGID
    pub async fn provision_bind_mounts(&self, document: &ComposeDocument, log: &BuildLog) {
        let dirs = match self.bind_mount_dirs(document) {
            Ok(dirs) => dirs,
            Err(e) => {
                log.warning(format!("Could not list bind mounts: {}", e));
                return;
            }
        };
        for path in dirs {
            let dir = Dir::new(&path);
            match dir.create().await {
                Ok(()) => {
                    debug!("Provisioned {}", path.display());
                    self.chown(&dir, log).await;
                }
                Err(e) => log.warning(format!("Could not create {}: {}", path.display(), e)),
            }
        }
    }

    /// Copy the compose document where the platform looks for it
    pub async fn publish_metadata(&self, app_id: &str, compose_yaml: &str, log: &BuildLog) {
        let dir = self.metadata_dir(app_id);
        if let Err(e) = dir.create().await {
            log.warning(format!(
                "Could not create metadata directory {}: {}",
                dir.path().display(),
                e
            ));
            return;
        }
        let file = dir.file(COMPOSE_FILE_NAME);
        match file.write_atomic(compose_yaml.as_bytes()).await {
            Ok(()) => {
                log.info(format!("Registered app with the platform at {}", dir.path().display()));
                self.chown(&dir, log).await;
            }
            Err(e) => log.warning(format!("Could not write platform metadata: {}", e)),
        }
    }

    async fn run_hook(
        &self,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
        log: &BuildLog,
    ) -> Result<(), BotError> {
        let mut spec = CommandSpec::new("sh")
            .args(["-c", command])
            .current_dir(cwd)
            .timeout(self.timeouts.deploy())
            .kill_grace(self.timeouts.kill_grace());
        for (key, value) in env {
            spec = spec.env(key.clone(), value.clone());
        }
        let sink = |line: &str| log.info(line);
        run_command(&spec, Some(&sink)).await?;
        Ok(())
    }

    /// Run the document's pre-install command; failure aborts the build
    pub async fn run_pre_install(
        &self,
        document: &ComposeDocument,
        cwd: &Path,
        env: &BTreeMap<String, String>,
        log: &BuildLog,
    ) -> Result<(), BotError> {
        let Some(command) = document.metadata_str(PRE_INSTALL_KEY) else {
            return Ok(());
        };
        log.system(format!("Running pre-install command: {}", command));
        self.run_hook(&command, cwd, env, log)
            .await
            .map_err(|e| BotError::HookError(format!("pre-install command failed: {}", e)))?;
        log.success("Pre-install command finished");
        Ok(())
    }

    /// Run the document's post-install command; failure is only logged
    pub async fn run_post_install(
        &self,
        document: &ComposeDocument,
        cwd: &Path,
        env: &BTreeMap<String, String>,
        log: &BuildLog,
    ) {
        let Some(command) = document.metadata_str(POST_INSTALL_KEY) else {
            return;
        };
        log.system(format!("Running post-install command: {}", command));
        match self.run_hook(&command, cwd, env, log).await {
            Ok(()) => log.success("Post-install command finished"),
            Err(e) => log.warning(format!("Post-install command failed: {}", e)),
        }
    }

    /// Re-own app data and metadata after the runtime may have created paths as root
    pub async fn normalize_ownership(&self, app_id: &str, log: &BuildLog) {
        for dir in [self.app_data_dir(app_id), self.metadata_dir(app_id)] {
            if dir.exists().await {
                self.chown(&dir, log).await;
            }
        }
    }

    /// Remove the app's metadata and data directories
    pub async fn cleanup(&self, app_id: &str, log: &BuildLog) {
        for dir in [self.metadata_dir(app_id), self.app_data_dir(app_id)] {
            match dir.delete().await {
                Ok(()) => debug!("Removed {}", dir.path().display()),
                Err(e) => log.warning(format!(
                    "Could not remove {}: {}",
                    dir.path().display(),
                    e
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(root: &Path) -> RegistryProcessor {
        RegistryProcessor::new(
            PlatformSettings {
                data_root: root.join("data"),
                metadata_root: root.join("apps"),
                ..Default::default()
            },
            TimeoutSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_bind_mount_dirs_only_under_data_root() {
        let tmp = tempfile::tempdir().unwrap();
        let p = processor(tmp.path());
        let data = tmp.path().join("data").display().to_string();
        let text = format!(
            "services:\n  app:\n    image: a\n    volumes:\n      - {data}/echo/data:/app/data\n      - /etc/localtime:/etc/localtime:ro\n      - {data}/echo/data:/backup\n"
        );
        let doc = ComposeDocument::parse(&text).unwrap();
        let dirs = p.bind_mount_dirs(&doc).unwrap();
        assert_eq!(dirs, vec![tmp.path().join("data/echo/data")]);
    }

    #[tokio::test]
    async fn test_pre_install_failure_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let p = processor(tmp.path());
        let doc = ComposeDocument::parse(
            "services:\n  app:\n    image: a\nx-casaos:\n  pre-install-cmd: exit 7\n",
        )
        .unwrap();
        let log = BuildLog::new("b1", 100);
        let err = p
            .run_pre_install(&doc, tmp.path(), &BTreeMap::new(), &log)
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::HookError(_)));
    }

    #[tokio::test]
    async fn test_publish_and_cleanup_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let p = processor(tmp.path());
        let log = BuildLog::new("b1", 100);

        p.publish_metadata("echo", "services: {}\n", &log).await;
        let published = tmp.path().join("apps/echo").join(COMPOSE_FILE_NAME);
        assert!(published.is_file());

        p.cleanup("echo", &log).await;
        assert!(!tmp.path().join("apps/echo").exists());
    }
}

//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::BotError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Name of the compose document written to each bot's working directory
pub const COMPOSE_FILE_NAME: &str = "docker-compose.yml";

/// Storage layout for the manager
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// The bot registry document
    pub fn registry_file(&self) -> File {
        File::new(self.base_dir.join("bots.json"))
    }

    /// Parent of all per-bot working directories
    pub fn bots_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("bots"))
    }

    /// Working tree of one bot
    pub fn bot_dir(&self, bot_id: &str) -> Dir {
        self.bots_dir().subdir(bot_id)
    }

    /// Checkout of a git-sourced bot
    pub fn repo_dir(&self, bot_id: &str) -> Dir {
        self.bot_dir(bot_id).subdir("repo")
    }

    /// Generated compose document of a bot
    pub fn compose_file(&self, bot_id: &str) -> File {
        self.bot_dir(bot_id).file(COMPOSE_FILE_NAME)
    }

    /// Resolved substitution variables of the last build
    pub fn env_file(&self, bot_id: &str) -> File {
        self.bot_dir(bot_id).file("env.json")
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), BotError> {
        Dir::new(&self.base_dir).create().await?;
        self.bots_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/var/lib/botyard")
    }
}

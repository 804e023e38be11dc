//! Repository inspection for git-sourced bots

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::compose::document::find_compose_file;
use crate::errors::BotError;
use crate::models::bot::DetectedSource;

/// Manifest files mapped to the language they indicate, in priority order
const LANGUAGE_MARKERS: &[(&str, &str)] = &[
    ("package.json", "node"),
    ("requirements.txt", "python"),
    ("pyproject.toml", "python"),
    ("Pipfile", "python"),
    ("go.mod", "go"),
    ("Cargo.toml", "rust"),
];

/// Dependency names that mean the bot talks to a SQL database
const DATABASE_MARKERS: &[&str] = &[
    "\"pg\"",
    "postgres",
    "psycopg",
    "asyncpg",
    "sqlalchemy",
    "prisma",
    "sequelize",
    "typeorm",
    "knex",
    "sqlx",
    "diesel",
    "gorm",
];

/// Source inspection capability
#[async_trait]
pub trait SourceDetector: Send + Sync {
    async fn detect(&self, repo_dir: &Path) -> Result<DetectedSource, BotError>;
}

/// Detection from the presence and content of well-known files
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDetector;

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[async_trait]
impl SourceDetector for FileDetector {
    async fn detect(&self, repo_dir: &Path) -> Result<DetectedSource, BotError> {
        if tokio::fs::metadata(repo_dir).await.is_err() {
            return Err(BotError::NotFound(format!(
                "Repository directory {} does not exist",
                repo_dir.display()
            )));
        }

        let mut detected = DetectedSource {
            has_dockerfile: is_file(&repo_dir.join("Dockerfile")).await,
            has_compose: find_compose_file(repo_dir).await.is_some(),
            ..Default::default()
        };

        let mut manifests = Vec::new();
        for (file, language) in LANGUAGE_MARKERS {
            let path = repo_dir.join(file);
            if is_file(&path).await {
                if detected.language.is_none() {
                    detected.language = Some(language.to_string());
                }
                manifests.push(path);
            }
        }

        for manifest in manifests {
            match tokio::fs::read_to_string(&manifest).await {
                Ok(contents) => {
                    let contents = contents.to_ascii_lowercase();
                    if DATABASE_MARKERS.iter().any(|m| contents.contains(m)) {
                        detected.has_database = true;
                        break;
                    }
                }
                Err(e) => debug!("Skipping unreadable {}: {}", manifest.display(), e),
            }
        }

        debug!("Detected {:?} in {}", detected, repo_dir.display());
        Ok(detected)
    }
}

const NODE_DOCKERFILE: &str = r#"FROM node:20-alpine
WORKDIR /app
COPY package*.json ./
RUN npm ci --omit=dev || npm install --omit=dev
COPY . .
RUN mkdir -p /app/data
CMD ["npm", "start"]
"#;

const PYTHON_DOCKERFILE: &str = r#"FROM python:3.12-slim
WORKDIR /app
ENV PYTHONUNBUFFERED=1
COPY . .
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; \
    elif [ -f pyproject.toml ]; then pip install --no-cache-dir .; fi
RUN mkdir -p /app/data
CMD ["sh", "-c", "python main.py || python bot.py"]
"#;

/// Dockerfile used when a repository ships none
pub fn default_dockerfile(language: Option<&str>) -> Option<&'static str> {
    match language? {
        "node" => Some(NODE_DOCKERFILE),
        "python" => Some(PYTHON_DOCKERFILE),
        _ => None,
    }
}

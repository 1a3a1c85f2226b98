//! Hugging Face Hub access for model checkpoints and datasets

use anyhow::{anyhow, Context, Result};
use hf_hub::api::tokio::{Api, ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Local paths of a downloaded model checkpoint
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub repo_id: String,
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: PathBuf,
    /// SafeTensors shards in load order
    pub weights: Vec<PathBuf>,
}

/// Thin wrapper over the hf-hub async client
pub struct HubClient {
    api: Api,
}

impl HubClient {
    /// Create a client; the token falls back to the cached hub login
    pub fn new(token: Option<String>) -> Result<Self> {
        let mut builder = ApiBuilder::from_env().with_progress(true);
        if token.is_some() {
            builder = builder.with_token(token);
        }
        let api = builder
            .build()
            .map_err(|e| anyhow!("Failed to initialize HF API: {}", e))?;
        Ok(Self { api })
    }

    /// Download config, tokenizer and SafeTensors weights of a model
    pub async fn fetch_model(&self, repo_id: &str, revision: &str) -> Result<ModelFiles> {
        tracing::info!("Fetching model {} ({})", repo_id, revision);
        let repo = self.api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let config = get(&repo, repo_id, "config.json").await?;
        let tokenizer = get(&repo, repo_id, "tokenizer.json").await?;
        let tokenizer_config = get(&repo, repo_id, "tokenizer_config.json").await?;

        let weights = match repo.get("model.safetensors.index.json").await {
            Ok(index) => {
                let shards = shard_names(&index)?;
                tracing::info!("Model is sharded into {} files", shards.len());
                let mut paths = Vec::with_capacity(shards.len());
                for shard in shards {
                    paths.push(get(&repo, repo_id, &shard).await?);
                }
                paths
            }
            Err(_) => vec![get(&repo, repo_id, "model.safetensors").await?],
        };

        Ok(ModelFiles {
            repo_id: repo_id.to_string(),
            config,
            tokenizer,
            tokenizer_config,
            weights,
        })
    }

    /// Download one file from a dataset repository
    pub async fn fetch_dataset_file(&self, repo_id: &str, filename: &str) -> Result<PathBuf> {
        tracing::info!("Fetching dataset {}/{}", repo_id, filename);
        let repo = self.api.dataset(repo_id.to_string());
        get(&repo, repo_id, filename).await
    }
}

async fn get(repo: &ApiRepo, repo_id: &str, filename: &str) -> Result<PathBuf> {
    repo.get(filename)
        .await
        .with_context(|| format!("Failed to download {} from {}", filename, repo_id))
}

/// Unique shard file names listed in a `model.safetensors.index.json`
pub fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(index_path)
        .with_context(|| format!("Failed to read {:?}", index_path))?;
    let index: serde_json::Value = serde_json::from_str(&content)?;
    let weight_map = index
        .get("weight_map")
        .and_then(|v| v.as_object())
        .ok_or_else(|| anyhow!("No weight_map in {:?}", index_path))?;

    let shards: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    Ok(shards.into_iter().collect())
}

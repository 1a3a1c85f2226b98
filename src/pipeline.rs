//! End-to-end fine-tuning run
//!
//! Stages run strictly in order: device selection, model setup, dataset
//! preparation, trainer setup, then training, adapter saving and the smoke
//! test. Any stage error ends the run except inside the smoke test. The
//! tracker run is finished on every path.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::qwen2;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Settings;
use crate::dataset::{
    format_instruction, load_records, tokenize_fixed_length, train_test_split, TokenizedExample,
};
use crate::device::{hardware_label, resolve_dtype, select_device};
use crate::hub::{HubClient, ModelFiles};
use crate::lora::{load_adapter, merge_into_dir, ADAPTER_PREFIX};
use crate::runtime::{
    count_parameters, load_tokenizer, ParameterSummary, Qwen2ForTraining, TextGenerationPipeline,
    TokenizerBundle,
};
use crate::smoke_test::{run_smoke_test, SmokeTestOutcome, TextGenerator};
use crate::tracking::{self, ExperimentTracker};
use crate::training::SftTrainer;

/// Run every stage with `settings`
pub async fn run(settings: Settings) -> Result<()> {
    let device = select_device(settings.model.device)?;
    let dtype = resolve_dtype(settings.model.dtype, &device);
    tracing::info!("Model dtype {:?}", dtype);

    let mut run_config = serde_json::to_value(&settings)?;
    run_config["hardware"] = hardware_label(&device).into();
    let tracker = tracking::init(&settings.tracking, &settings.training.run_name, &run_config)
        .context("Failed to start experiment tracking")?;

    let settings = &settings;
    run_tracked(tracker, move |tracker| run_stages(settings, device, dtype, tracker)).await
}

/// Drive `stages` and finish the tracker run with exit code 0 on success or
/// 1 on failure. The stage error is returned unchanged.
pub async fn run_tracked<F, Fut>(tracker: Arc<dyn ExperimentTracker>, stages: F) -> Result<()>
where
    F: FnOnce(Arc<dyn ExperimentTracker>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let result = stages(tracker.clone()).await;

    let exit_code = if result.is_ok() { 0 } else { 1 };
    if let Err(e) = tracker.finish(exit_code) {
        tracing::warn!("Failed to finish tracking run: {}", e);
    }
    result
}

struct PreparedData {
    train: Vec<TokenizedExample>,
    eval: Vec<TokenizedExample>,
}

async fn run_stages(
    settings: &Settings,
    device: Device,
    dtype: DType,
    tracker: Arc<dyn ExperimentTracker>,
) -> Result<()> {
    let hub = HubClient::new(settings.model.hf_token.clone())?;

    println!("\nSetting up model...");
    let files = hub
        .fetch_model(&settings.model.name, &settings.model.revision)
        .await
        .with_context(|| format!("Failed to fetch model {}", settings.model.name))?;
    let tokenizer = load_tokenizer(&files.tokenizer, &files.tokenizer_config)
        .context("Failed to load tokenizer")?;
    let varmap = VarMap::new();
    let model = build_model(settings, &files, &varmap, &device, dtype)?;

    let trainable: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
    let summary = ParameterSummary {
        trainable,
        total: count_parameters(&files.weights)? + trainable,
    };
    println!("{summary}");

    println!("\nPreparing dataset...");
    let data = prepare_dataset(&hub, settings, &tokenizer).await?;

    println!("\nSetting up trainer...");
    let mut lora_config = settings.lora.clone();
    lora_config.base_model_name_or_path = Some(settings.model.name.clone());
    let trainer = SftTrainer::new(
        model,
        varmap,
        lora_config,
        settings.training.clone(),
        data.train,
        data.eval,
        tokenizer.pad_id(),
        tracker.clone(),
    );

    println!("\nStarting training...");
    let (trainer, output) = tokio::task::spawn_blocking(move || {
        let mut trainer = trainer;
        let output = trainer.train()?;
        Ok::<_, anyhow::Error>((trainer, output))
    })
    .await
    .context("Training task panicked")?
    .context("Training failed")?;
    tracing::info!("Train metrics: {:?}", output.metrics);

    println!("\nSaving model...");
    let adapter_dir = settings.training.final_adapter_dir.clone();
    trainer
        .save_model(&adapter_dir)
        .with_context(|| format!("Failed to save adapter to {:?}", adapter_dir))?;
    // Free training tensors before loading the merged model.
    drop(trainer);

    if !settings.smoke_test.enabled {
        tracing::info!("Smoke test disabled");
        return Ok(());
    }

    println!("\nTesting model...");
    let outcome = smoke_test(settings, files, tokenizer, adapter_dir, device, dtype, tracker).await?;
    if let SmokeTestOutcome::Failed { error } = &outcome {
        tracing::warn!("Smoke test failed: {}", error);
    }
    Ok(())
}

fn build_model(
    settings: &Settings,
    files: &ModelFiles,
    varmap: &VarMap,
    device: &Device,
    dtype: DType,
) -> Result<Qwen2ForTraining> {
    let config: qwen2::Config = serde_json::from_str(
        &std::fs::read_to_string(&files.config)
            .with_context(|| format!("Failed to read {:?}", files.config))?,
    )
    .context("Unsupported model config")?;

    // SAFETY: hub cache files are not modified while mapped.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device)? };
    let lora_vb = VarBuilder::from_varmap(varmap, DType::F32, device).pp(ADAPTER_PREFIX);
    let model = Qwen2ForTraining::new(&config, &settings.lora, settings.dataset.max_seq_len, vb, lora_vb)
        .with_context(|| format!("Failed to build model from {}", files.repo_id))?;

    if varmap.all_vars().is_empty() {
        bail!(
            "None of the target modules {:?} exist in the model",
            settings.lora.target_modules
        );
    }
    Ok(model)
}

async fn prepare_dataset(
    hub: &HubClient,
    settings: &Settings,
    tokenizer: &TokenizerBundle,
) -> Result<PreparedData> {
    let config = &settings.dataset;
    let path = hub
        .fetch_dataset_file(&config.repo, config.data_file()?)
        .await
        .with_context(|| format!("Failed to fetch dataset {}", config.repo))?;
    let records = load_records(&path).with_context(|| format!("Failed to read {:?}", path))?;
    println!("Dataset loaded with {} training examples", records.len());

    let split = train_test_split(records, config.train_fraction, config.test_fraction, config.seed)?;
    let sample = format_instruction(&split.train[0], &tokenizer.eos_token);

    let eos = tokenizer.eos_token.clone();
    let fixed = tokenizer.fixed_length(config.max_seq_len)?;
    let max_len = config.max_seq_len;
    let eval_limit = if settings.training.eval_holdout {
        settings.training.eval_max_samples
    } else {
        0
    };
    tracing::debug!("Tokenizing on {} CPUs", num_cpus::get());

    let data = tokio::task::spawn_blocking(move || -> Result<PreparedData> {
        let render = |records: &[crate::dataset::MedicalRecord]| -> Vec<String> {
            records.iter().map(|r| format_instruction(r, &eos)).collect()
        };
        let train = tokenize_fixed_length(&fixed, render(&split.train), max_len)?;
        let eval_records = &split.test[..eval_limit.min(split.test.len())];
        let eval = tokenize_fixed_length(&fixed, render(eval_records), max_len)?;
        Ok(PreparedData { train, eval })
    })
    .await
    .context("Tokenization task panicked")??;

    println!("\nUsing {} examples for training", data.train.len());
    println!("\nSample formatted data:");
    println!("{sample}");

    Ok(data)
}

async fn smoke_test(
    settings: &Settings,
    files: ModelFiles,
    tokenizer: TokenizerBundle,
    adapter_dir: PathBuf,
    device: Device,
    dtype: DType,
    tracker: Arc<dyn ExperimentTracker>,
) -> Result<SmokeTestOutcome> {
    let offload_dir = settings.smoke_test.offload_dir.clone();
    let prompt = settings.smoke_test.prompt.clone();
    let generation = settings.generation.clone();

    let outcome = tokio::task::spawn_blocking(move || {
        run_smoke_test(&offload_dir, &prompt, tracker.as_ref(), |scratch: &Path| {
            let adapter = load_adapter(&adapter_dir, &Device::Cpu)
                .with_context(|| format!("Failed to load adapter from {:?}", adapter_dir))?;
            let merged = merge_into_dir(&files.weights, &adapter, scratch)
                .context("Failed to merge adapter into base weights")?;
            let pipeline =
                TextGenerationPipeline::load(&files.config, &merged, tokenizer, generation, &device, dtype)?;
            Ok(Box::new(pipeline) as Box<dyn TextGenerator>)
        })
    })
    .await
    .context("Smoke test task panicked")?;

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::{LocalRunTracker, Metrics, RunRecord, RunStatus};

    fn local_tracker(dir: &Path) -> Arc<LocalRunTracker> {
        Arc::new(LocalRunTracker::create(dir, "proj", "run", &serde_json::json!({})).unwrap())
    }

    fn run_record(tracker: &LocalRunTracker) -> RunRecord {
        serde_json::from_str(&std::fs::read_to_string(tracker.run_dir().join("run.json")).unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn test_failed_stage_finishes_run_with_exit_code_one() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = local_tracker(dir.path());

        let result = run_tracked(tracker.clone(), |tracker| async move {
            tracker.log(1, &Metrics::from([("train/loss".to_string(), 2.0)])).unwrap();
            Err::<(), _>(anyhow::anyhow!("dataset download failed"))
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("dataset download failed"));

        let record = run_record(&tracker);
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.exit_code, Some(1));
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_successful_stages_finish_run_with_exit_code_zero() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = local_tracker(dir.path());

        run_tracked(tracker.clone(), |_| async { Ok(()) }).await.unwrap();

        let record = run_record(&tracker);
        assert_eq!(record.status, RunStatus::Finished);
        assert_eq!(record.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_finish_failure_keeps_stage_result() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = local_tracker(dir.path());
        tracker.finish(0).unwrap();

        run_tracked(tracker.clone(), |_| async { Ok(()) }).await.unwrap();
        let result =
            run_tracked(tracker, |_| async { Err::<(), _>(anyhow::anyhow!("boom")) }).await;
        assert!(result.is_err());
    }
}

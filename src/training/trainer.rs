//! Supervised fine-tuning loop
//!
//! Each optimizer step runs backward on up to `gradient_accumulation_steps`
//! micro-batches, sums their adapter gradients, clips the global norm, then
//! applies AdamW with the scheduled learning rate.

use anyhow::{bail, Result};
use candle_core::{backprop::GradStore, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use super::collator::DataCollator;
use super::loss::causal_lm_loss;
use super::sampler::{length_grouped_order, random_order};
use super::scheduler::LinearSchedule;
use super::{SaveStrategy, TrainingArguments};
use crate::dataset::TokenizedExample;
use crate::lora::{save_pretrained, CheckpointManager, LoraConfig};
use crate::runtime::Qwen2ForTraining;
use crate::tracking::{ExperimentTracker, Metrics};

/// Progress persisted next to every checkpoint as `trainer_state.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: f64,
    pub max_steps: usize,
    pub num_train_epochs: usize,
    pub train_batch_size: usize,
    pub logging_steps: usize,
    pub log_history: Vec<Metrics>,
}

/// Summary returned by [`SftTrainer::train`]
#[derive(Debug, Clone)]
pub struct TrainOutput {
    pub global_step: usize,
    /// Mean loss over all optimizer steps
    pub training_loss: f64,
    pub metrics: Metrics,
}

/// Fine-tunes the adapter variables of a [`Qwen2ForTraining`]
pub struct SftTrainer {
    model: Qwen2ForTraining,
    varmap: VarMap,
    lora_config: LoraConfig,
    args: TrainingArguments,
    train_dataset: Vec<TokenizedExample>,
    eval_dataset: Vec<TokenizedExample>,
    collator: DataCollator,
    tracker: Arc<dyn ExperimentTracker>,
    state: TrainerState,
}

impl SftTrainer {
    /// `varmap` must hold exactly the adapter variables created for `model`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Qwen2ForTraining,
        varmap: VarMap,
        lora_config: LoraConfig,
        args: TrainingArguments,
        train_dataset: Vec<TokenizedExample>,
        eval_dataset: Vec<TokenizedExample>,
        pad_id: u32,
        tracker: Arc<dyn ExperimentTracker>,
    ) -> Self {
        let state = TrainerState {
            num_train_epochs: args.num_train_epochs,
            train_batch_size: args.per_device_train_batch_size,
            logging_steps: args.logging_steps,
            ..Default::default()
        };
        Self {
            model,
            varmap,
            lora_config,
            args,
            train_dataset,
            eval_dataset,
            collator: DataCollator::new(pad_id),
            tracker,
            state,
        }
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn train(&mut self) -> Result<TrainOutput> {
        let num_examples = self.train_dataset.len();
        if num_examples == 0 {
            bail!("training dataset is empty");
        }

        let batch_size = self.args.per_device_train_batch_size;
        let accumulation = self.args.gradient_accumulation_steps;
        let max_steps = self.args.total_steps(num_examples);
        let steps_per_epoch = self.args.steps_per_epoch(num_examples);
        let schedule =
            LinearSchedule::with_warmup_ratio(self.args.learning_rate, self.args.warmup_ratio, max_steps);

        let vars = self.varmap.all_vars();
        if vars.is_empty() {
            bail!("model has no trainable adapter variables");
        }
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: schedule.lr_at(0),
                weight_decay: self.args.weight_decay,
                ..Default::default()
            },
        )?;

        let checkpoints = CheckpointManager::new(&self.args.output_dir)
            .with_save_total_limit(self.args.save_total_limit);

        self.state.max_steps = max_steps;
        tracing::info!("***** Running training *****");
        tracing::info!("  Num examples = {}", num_examples);
        tracing::info!("  Num epochs = {}", self.args.num_train_epochs);
        tracing::info!("  Batch size per device = {}", batch_size);
        tracing::info!("  Gradient accumulation steps = {}", accumulation);
        tracing::info!("  Total optimization steps = {}", max_steps);
        tracing::info!("  Warmup steps = {}", schedule.warmup_steps());
        tracing::info!("  Trainable tensors = {}", vars.len());

        let progress = ProgressBar::new(max_steps as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );

        let lengths: Vec<usize> = self.train_dataset.iter().map(|e| e.real_length()).collect();
        let start = Instant::now();
        let mut loss_sum_all = 0.0f64;
        let mut loss_sum_window = 0.0f64;
        let mut steps_in_window = 0usize;

        for epoch in 0..self.args.num_train_epochs {
            let order = if self.args.group_by_length {
                length_grouped_order(&lengths, batch_size, self.args.seed, epoch)
            } else {
                random_order(num_examples, self.args.seed, epoch)
            };
            let micro_batches: Vec<&[usize]> = order.chunks(batch_size).collect();

            for (step_in_epoch, group) in micro_batches.chunks(accumulation).enumerate() {
                let (loss, mut grads) = self.accumulate(group, &vars)?;
                let grad_norm = clip_grad_norm(&mut grads, &vars, self.args.max_grad_norm)?;

                let lr = schedule.lr_at(self.state.global_step);
                optimizer.set_learning_rate(lr);
                optimizer.step(&grads)?;

                self.state.global_step += 1;
                self.state.epoch = epoch as f64 + (step_in_epoch + 1) as f64 / steps_per_epoch as f64;
                loss_sum_all += loss;
                loss_sum_window += loss;
                steps_in_window += 1;

                progress.set_message(format!("loss {:.4} lr {:.2e}", loss, lr));
                progress.inc(1);

                if self.state.global_step % self.args.logging_steps == 0 {
                    self.log_train(loss_sum_window / steps_in_window as f64, grad_norm, lr);
                    loss_sum_window = 0.0;
                    steps_in_window = 0;
                }

                if self.args.save_strategy == SaveStrategy::Steps
                    && self.state.global_step % self.args.save_steps.max(1) == 0
                {
                    checkpoints.save(self.state.global_step, &self.varmap, &self.lora_config, &self.state)?;
                }
            }

            self.state.epoch = (epoch + 1) as f64;
            if self.args.eval_holdout && !self.eval_dataset.is_empty() {
                let eval_loss = self.evaluate()?;
                tracing::info!("Epoch {} eval loss {:.4}", epoch + 1, eval_loss);
                let mut metrics = Metrics::new();
                metrics.insert("eval/loss".into(), eval_loss);
                metrics.insert("train/epoch".into(), self.state.epoch);
                self.record(metrics);
            }
            if self.args.save_strategy == SaveStrategy::Epoch {
                checkpoints.save(self.state.global_step, &self.varmap, &self.lora_config, &self.state)?;
            }
        }

        progress.finish_and_clear();

        let runtime = start.elapsed().as_secs_f64();
        let training_loss = loss_sum_all / self.state.global_step.max(1) as f64;
        let samples = (num_examples * self.args.num_train_epochs) as f64;

        let mut metrics = Metrics::new();
        metrics.insert("train_runtime".into(), runtime);
        metrics.insert("train_samples_per_second".into(), samples / runtime.max(f64::EPSILON));
        metrics.insert(
            "train_steps_per_second".into(),
            self.state.global_step as f64 / runtime.max(f64::EPSILON),
        );
        metrics.insert("train_loss".into(), training_loss);
        metrics.insert("epoch".into(), self.state.epoch);
        self.record(metrics.clone());

        tracing::info!(
            "Training completed: {} steps in {:.1}s, mean loss {:.4}",
            self.state.global_step,
            runtime,
            training_loss
        );

        Ok(TrainOutput {
            global_step: self.state.global_step,
            training_loss,
            metrics,
        })
    }

    /// Mean loss over the held-out examples, without dropout or gradients
    pub fn evaluate(&self) -> Result<f64> {
        let limit = self.args.eval_max_samples.min(self.eval_dataset.len());
        let examples: Vec<&TokenizedExample> = self.eval_dataset[..limit].iter().collect();
        if examples.is_empty() {
            bail!("evaluation dataset is empty");
        }

        let mut total = 0.0f64;
        let mut batches = 0usize;
        for chunk in examples.chunks(self.args.per_device_train_batch_size) {
            let batch = self.collator.collate(chunk, self.model.device())?;
            let logits = self.model.forward_t(&batch.input_ids, false)?.detach();
            total += causal_lm_loss(&logits, &batch)?.to_scalar::<f32>()? as f64;
            batches += 1;
        }
        Ok(total / batches as f64)
    }

    /// Write the adapter (weights and config) to `dir`
    pub fn save_model(&self, dir: &Path) -> Result<()> {
        save_pretrained(dir, &self.varmap, &self.lora_config)?;
        Ok(())
    }

    /// Backward over a group of micro-batches; returns the group's mean loss
    /// and a gradient store holding the summed adapter gradients.
    fn accumulate(&self, group: &[&[usize]], vars: &[Var]) -> Result<(f64, GradStore)> {
        let scale = 1.0 / group.len() as f64;
        let mut sums: Vec<Option<Tensor>> = vec![None; vars.len()];
        let mut last_store = None;
        let mut loss_total = 0.0f64;

        for indices in group {
            let examples: Vec<&TokenizedExample> =
                indices.iter().map(|&i| &self.train_dataset[i]).collect();
            let batch = self.collator.collate(&examples, self.model.device())?;

            let logits = self.model.forward_t(&batch.input_ids, true)?;
            let loss = (causal_lm_loss(&logits, &batch)? * scale)?;
            loss_total += loss.to_scalar::<f32>()? as f64;

            let grads = loss.backward()?;
            for (sum, var) in sums.iter_mut().zip(vars) {
                if let Some(g) = grads.get(var.as_tensor()) {
                    *sum = Some(match sum.take() {
                        None => g.clone(),
                        Some(prev) => (prev + g)?,
                    });
                }
            }
            last_store = Some(grads);
        }

        let Some(mut store) = last_store else {
            bail!("empty gradient accumulation group");
        };
        for (sum, var) in sums.into_iter().zip(vars) {
            store.remove(var.as_tensor());
            if let Some(sum) = sum {
                store.insert(var.as_tensor(), sum);
            }
        }
        Ok((loss_total, store))
    }

    fn log_train(&mut self, loss: f64, grad_norm: f64, lr: f64) {
        tracing::info!(
            "step {} | loss {:.4} | grad_norm {:.4} | learning_rate {:.3e} | epoch {:.2}",
            self.state.global_step,
            loss,
            grad_norm,
            lr,
            self.state.epoch
        );
        let mut metrics = Metrics::new();
        metrics.insert("train/loss".into(), loss);
        metrics.insert("train/grad_norm".into(), grad_norm);
        metrics.insert("train/learning_rate".into(), lr);
        metrics.insert("train/epoch".into(), self.state.epoch);
        self.record(metrics);
    }

    /// Send metrics to the tracker and the state's log history
    fn record(&mut self, metrics: Metrics) {
        let step = self.state.global_step as u64;
        if let Err(e) = self.tracker.log(step, &metrics) {
            tracing::warn!("Failed to log metrics at step {}: {}", step, e);
        }
        let mut entry = metrics;
        entry.insert("step".into(), step as f64);
        self.state.log_history.push(entry);
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = total.sqrt();
    if norm <= max_norm || norm == 0.0 {
        return Ok(norm);
    }

    let scale = max_norm / (norm + 1e-6);
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::{load_adapter, ADAPTER_PREFIX};
    use crate::runtime::qwen2::tests::{tiny_config, tiny_weights};
    use crate::tracking::NoopTracker;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    fn examples(n: usize, pad: u32) -> Vec<TokenizedExample> {
        (0..n)
            .map(|i| {
                let real = 4 + i % 4;
                let input_ids: Vec<u32> = (0..8)
                    .map(|t| if t < real { ((i + t) % 30 + 1) as u32 } else { pad })
                    .collect();
                let attention_mask = (0..8).map(|t| u32::from(t < real)).collect();
                TokenizedExample { input_ids, attention_mask }
            })
            .collect()
    }

    fn trainer(args: TrainingArguments, n: usize) -> SftTrainer {
        let device = Device::Cpu;
        let cfg = tiny_config();
        let vb = VarBuilder::from_tensors(tiny_weights(&cfg, &device), DType::F32, &device);
        let varmap = VarMap::new();
        let lora_vb = VarBuilder::from_varmap(&varmap, DType::F32, &device).pp(ADAPTER_PREFIX);
        let lora = LoraConfig::default();
        let model = Qwen2ForTraining::new(&cfg, &lora, 8, vb, lora_vb).unwrap();
        SftTrainer::new(
            model,
            varmap,
            lora,
            args,
            examples(n, 31),
            examples(4, 31),
            31,
            Arc::new(NoopTracker),
        )
    }

    #[test]
    fn test_clip_grad_norm() {
        let device = Device::Cpu;
        let var = Var::new(&[3.0f32, 4.0], &device).unwrap();
        let loss = (var.as_tensor() * 1.0).unwrap().sqr().unwrap().sum_all().unwrap();
        // d/dx sum(x^2) = 2x = [6, 8], norm 10
        let mut grads = loss.backward().unwrap();

        let norm = clip_grad_norm(&mut grads, &[var.clone()], 1.0).unwrap();
        assert!((norm - 10.0).abs() < 1e-4);

        let clipped = grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert!((clipped[0] - 0.6).abs() < 1e-4);
        assert!((clipped[1] - 0.8).abs() < 1e-4);
    }

    #[test]
    fn test_train_runs_expected_steps_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let args = TrainingArguments {
            output_dir: dir.path().join("out"),
            num_train_epochs: 2,
            per_device_train_batch_size: 2,
            gradient_accumulation_steps: 2,
            logging_steps: 1,
            learning_rate: 1e-2,
            save_total_limit: Some(1),
            eval_holdout: true,
            ..Default::default()
        };
        let mut trainer = trainer(args, 10);

        let output = trainer.train().unwrap();
        // 10 examples -> 5 micro-batches -> 3 steps per epoch
        assert_eq!(output.global_step, 6);
        assert!(output.training_loss.is_finite());
        assert!(output.metrics.contains_key("train_runtime"));
        assert_eq!(trainer.state().epoch, 2.0);
        assert!(trainer
            .state()
            .log_history
            .iter()
            .any(|entry| entry.contains_key("eval/loss")));

        let manager = CheckpointManager::new(dir.path().join("out"));
        let checkpoints = manager.list_checkpoints().unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].1, 6);
    }

    /// Mean loss per optimizer step of the first epoch, for an unchanging model
    fn expected_step_losses(trainer: &SftTrainer) -> Vec<f64> {
        let args = &trainer.args;
        let lengths: Vec<usize> = trainer.train_dataset.iter().map(|e| e.real_length()).collect();
        let order = if args.group_by_length {
            length_grouped_order(&lengths, args.per_device_train_batch_size, args.seed, 0)
        } else {
            random_order(lengths.len(), args.seed, 0)
        };
        let micro_batches: Vec<&[usize]> = order.chunks(args.per_device_train_batch_size).collect();

        micro_batches
            .chunks(args.gradient_accumulation_steps)
            .map(|group| {
                let total: f64 = group
                    .iter()
                    .map(|indices| {
                        let examples: Vec<&TokenizedExample> =
                            indices.iter().map(|&i| &trainer.train_dataset[i]).collect();
                        let batch = trainer.collator.collate(&examples, trainer.model.device()).unwrap();
                        let logits = trainer.model.forward_t(&batch.input_ids, false).unwrap();
                        causal_lm_loss(&logits, &batch).unwrap().to_scalar::<f32>().unwrap() as f64
                    })
                    .sum();
                total / group.len() as f64
            })
            .collect()
    }

    fn logged_losses(trainer: &SftTrainer) -> Vec<(f64, f64)> {
        trainer
            .state()
            .log_history
            .iter()
            .filter_map(|entry| Some((entry["step"], *entry.get("train/loss")?)))
            .collect()
    }

    #[test]
    fn test_logged_loss_covers_partial_group_and_window() {
        // A zero learning rate and zero-initialised B keep the model fixed, so
        // every step's loss can be recomputed outside the loop.
        let args = TrainingArguments {
            save_strategy: SaveStrategy::No,
            num_train_epochs: 1,
            per_device_train_batch_size: 2,
            gradient_accumulation_steps: 2,
            logging_steps: 1,
            learning_rate: 0.0,
            ..Default::default()
        };
        let mut per_step = trainer(args.clone(), 10);
        let expected = expected_step_losses(&per_step);
        // 5 micro-batches: two full groups and a trailing group of one
        assert_eq!(expected.len(), 3);

        per_step.train().unwrap();
        let logged = logged_losses(&per_step);
        assert_eq!(logged.len(), 3);
        for (i, (step, loss)) in logged.iter().enumerate() {
            assert_eq!(*step, (i + 1) as f64);
            assert!((loss - expected[i]).abs() < 1e-4, "step {step}: {loss} vs {}", expected[i]);
        }

        // Logging every 3 steps reports the mean over the window.
        let mut windowed = trainer(TrainingArguments { logging_steps: 3, ..args }, 10);
        windowed.train().unwrap();
        let logged = logged_losses(&windowed);
        assert_eq!(logged.len(), 1);
        let window_mean = expected.iter().sum::<f64>() / 3.0;
        assert_eq!(logged[0].0, 3.0);
        assert!((logged[0].1 - window_mean).abs() < 1e-4);
    }

    #[test]
    fn test_training_moves_adapter_and_saves_it() {
        let dir = tempfile::tempdir().unwrap();
        let args = TrainingArguments {
            output_dir: dir.path().join("out"),
            save_strategy: SaveStrategy::No,
            learning_rate: 1e-2,
            warmup_ratio: 0.0,
            ..Default::default()
        };
        let mut trainer = trainer(args, 4);
        let before: Vec<Vec<f32>> = trainer
            .varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect();

        trainer.train().unwrap();
        let after: Vec<Vec<f32>> = trainer
            .varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect();
        assert_ne!(before, after);
        assert!(!dir.path().join("out").exists());

        let adapter_dir = dir.path().join("adapter");
        trainer.save_model(&adapter_dir).unwrap();
        let adapter = load_adapter(&adapter_dir, &Device::Cpu).unwrap();
        assert_eq!(adapter.modules().len(), 4);
    }

    #[test]
    fn test_empty_dataset_is_rejected() {
        let mut trainer = trainer(TrainingArguments::default(), 0);
        assert!(trainer.train().is_err());
    }
}

//! The fine-tuning loop: epoch iteration, per-step prediction and loss,
//! periodic backups, and the end-of-run save.

use anyhow::{Context, Result};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::TrainConfig;
use crate::model::{ModelSaver, ModelSetup, StableDiffusionModel, TrainOptimizer};
use crate::pipeline::TrainDataLoader;
use crate::trainers::predictor::{predict, DebugSink, FileDebugSink};

/// External control surface for a running trainer. Cloneable; a signal handler
/// or UI thread holds one end.
#[derive(Clone, Default)]
pub struct TrainCommands {
    stop: Arc<AtomicBool>,
}

impl TrainCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    Completed,
    Stopped,
}

pub struct FineTuneTrainer<O: TrainOptimizer, S: ModelSaver> {
    config: TrainConfig,
    model: StableDiffusionModel,
    setup: ModelSetup,
    data: TrainDataLoader,
    optimizer: O,
    saver: S,
    commands: TrainCommands,
}

impl<O: TrainOptimizer, S: ModelSaver> FineTuneTrainer<O, S> {
    pub fn new(
        config: TrainConfig,
        model: StableDiffusionModel,
        data: TrainDataLoader,
        optimizer: O,
        saver: S,
        commands: TrainCommands,
    ) -> Result<Self> {
        config.validate()?;
        let setup = ModelSetup::new(config.device()?, config.temp_device()?, config.debug_mode);
        Ok(Self {
            config,
            model,
            setup,
            data,
            optimizer,
            saver,
            commands,
        })
    }

    pub fn progress(&self) -> crate::progress::TrainProgress {
        self.model.train_progress
    }

    /// Place every component on its training device. Must run before `train`.
    pub fn start(&mut self) -> Result<()> {
        self.setup.setup_train_device(&self.model)
    }

    /// Run epochs until the configured count is reached or a stop is
    /// requested. Progress counters advance only after a step's optimizer
    /// update, so a stop or crash never skips a sample on resume.
    pub fn train(&mut self) -> Result<TrainOutcome> {
        let debug_sink = self.debug_sink();
        let debug: Option<&dyn DebugSink> = debug_sink.as_ref().map(|s| s as &dyn DebugSink);

        while self.model.train_progress.epoch < self.config.epochs {
            let epoch = self.model.train_progress.epoch;
            self.data.start_epoch(&self.model.train_progress)?;
            info!(
                "epoch {epoch}: {} batches of {}",
                self.data.batch_count(),
                self.data.batch_size()
            );

            #[cfg(feature = "progress-bar")]
            let bar = indicatif::ProgressBar::new(self.data.batch_count() as u64);

            while let Some(batch) = self.data.next_batch() {
                if self.commands.should_stop() {
                    warn!("stop requested, leaving the training loop");
                    return Ok(TrainOutcome::Stopped);
                }
                let batch = batch?;
                let prediction = predict(
                    &self.model,
                    &batch,
                    &self.config,
                    &self.model.train_progress,
                    debug,
                )?;
                let loss =
                    candle_nn::loss::mse(&prediction.predicted_noise, &prediction.noise)?;
                self.optimizer.backward_step(&loss)?;

                self.model.train_progress.next_step(batch.len());

                #[cfg(feature = "progress-bar")]
                bar.inc(1);
            }

            #[cfg(feature = "progress-bar")]
            bar.finish_and_clear();

            self.model.train_progress.next_epoch();

            if let Some(every) = self.config.backup_after_epochs {
                let completed = self.model.train_progress.epoch;
                if every > 0 && completed % every == 0 {
                    let destination = self.backup_dir().join(format!("epoch-{completed}"));
                    info!("writing backup to {}", destination.display());
                    self.saver
                        .save(&self.model, &destination)
                        .context("epoch backup failed")?;
                }
            }
        }
        Ok(TrainOutcome::Completed)
    }

    /// Tear down: restore eval device placement and perform the end-of-run
    /// save. A stopped run skips the save only when `backup_before_save` is
    /// disabled.
    pub fn end(mut self, outcome: TrainOutcome) -> Result<()> {
        self.setup.setup_eval_device(&self.model)?;
        if outcome == TrainOutcome::Stopped && !self.config.backup_before_save {
            warn!("run was stopped and backup_before_save is off, skipping the final save");
            return Ok(());
        }
        let destination = self.config.workspace_dir.join("save");
        info!("saving trained model to {}", destination.display());
        self.saver.save(&self.model, &destination)
    }

    fn backup_dir(&self) -> PathBuf {
        self.config.workspace_dir.join("backup")
    }

    fn debug_sink(&self) -> Option<FileDebugSink> {
        if !self.config.debug_mode {
            return None;
        }
        let dir = self
            .config
            .debug_dir
            .clone()
            .unwrap_or_else(|| self.config.workspace_dir.join("debug"))
            .join("train");
        Some(FileDebugSink::new(dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Concept, ModelType};
    use crate::data_loader::create_dataset;
    use crate::model::{DenoisingModel, LatentDistribution, TextEncoder, Vae};
    use crate::progress::TrainProgress;
    use crate::trainers::ddpm_scheduler::DdpmScheduler;
    use candle_core::{DType, Device, Tensor};
    use image::{Rgb, RgbImage};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct NullText;
    impl TextEncoder for NullText {
        fn encode(&self, _t: &str, batch_size: usize, _skip: usize) -> Result<(Tensor, Tensor)> {
            let e = Tensor::zeros((batch_size, 8, 16), DType::F32, &Device::Cpu)?;
            let m = Tensor::ones((batch_size, 8), DType::F32, &Device::Cpu)?;
            Ok((e, m))
        }
    }

    struct PoolingVae;
    impl Vae for PoolingVae {
        fn encode(&self, image: &Tensor) -> Result<LatentDistribution> {
            let mean = image.avg_pool2d(8)?;
            Ok(LatentDistribution::new(mean.clone(), mean.zeros_like()?))
        }
        fn decode(&self, latent: &Tensor) -> Result<Tensor> {
            Ok(latent.upsample_nearest2d(latent.dim(2)? * 8, latent.dim(3)? * 8)?)
        }
        fn scaling_factor(&self) -> f64 {
            0.18215
        }
    }

    struct EchoDenoiser;
    impl DenoisingModel for EchoDenoiser {
        fn forward(
            &self,
            latent: &Tensor,
            _timestep: &Tensor,
            _conditioning: &Tensor,
            _depth: Option<&Tensor>,
        ) -> Result<Tensor> {
            Ok(latent.clone())
        }
    }

    struct CountingOptimizer {
        steps: Arc<AtomicUsize>,
    }
    impl TrainOptimizer for CountingOptimizer {
        fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
            loss.to_scalar::<f32>()?;
            self.steps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RecordingSaver {
        saves: Arc<Mutex<Vec<PathBuf>>>,
    }
    impl ModelSaver for RecordingSaver {
        fn save(&self, _model: &StableDiffusionModel, destination: &Path) -> Result<()> {
            self.saves.lock().unwrap().push(destination.to_path_buf());
            Ok(())
        }
    }

    fn write_dataset(dir: &Path, count: usize) {
        for i in 0..count {
            let img = RgbImage::from_pixel(128, 128, Rgb([10 * i as u8, 80, 160]));
            img.save(dir.join(format!("img{i}.png"))).unwrap();
        }
    }

    fn build_trainer(
        dir: &Path,
        epochs: usize,
        commands: TrainCommands,
    ) -> (
        FineTuneTrainer<CountingOptimizer, RecordingSaver>,
        Arc<AtomicUsize>,
        Arc<Mutex<Vec<PathBuf>>>,
    ) {
        let yaml = format!(
            "model_type: sd15\nconcept_file_name: {0}/concepts.json\nworkspace_dir: {0}\nbatch_size: 2\nresolution: 128\nepochs: {epochs}\n",
            dir.display()
        );
        let config: TrainConfig = serde_yaml::from_str(&yaml).unwrap();

        let concepts = vec![Concept {
            name: "subject".to_string(),
            path: dir.to_path_buf(),
            enable_masking: true,
            include_subdirectories: false,
        }];
        let vae = Arc::new(PoolingVae);
        let data = create_dataset(&config, concepts, vae.clone()).unwrap();

        let model = StableDiffusionModel::new(
            ModelType::Sd15,
            Arc::new(NullText),
            vae,
            Arc::new(EchoDenoiser),
            DdpmScheduler::stable_diffusion(&Device::Cpu).unwrap(),
            TrainProgress::default(),
        );

        let steps = Arc::new(AtomicUsize::new(0));
        let saves = Arc::new(Mutex::new(Vec::new()));
        let trainer = FineTuneTrainer::new(
            config,
            model,
            data,
            CountingOptimizer {
                steps: steps.clone(),
            },
            RecordingSaver {
                saves: saves.clone(),
            },
            commands,
        )
        .unwrap();
        (trainer, steps, saves)
    }

    #[test]
    fn full_run_steps_every_batch_and_saves_once() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), 4);

        let (mut trainer, steps, saves) = build_trainer(dir.path(), 2, TrainCommands::new());
        trainer.start().unwrap();
        let outcome = trainer.train().unwrap();
        assert_eq!(outcome, TrainOutcome::Completed);
        // 4 images, batch 2, 2 epochs.
        assert_eq!(steps.load(Ordering::SeqCst), 4);
        assert_eq!(trainer.progress().global_step, 4);
        assert_eq!(trainer.progress().epoch, 2);

        trainer.end(outcome).unwrap();
        let saves = saves.lock().unwrap();
        assert_eq!(saves.len(), 1);
        assert!(saves[0].ends_with("save"));
    }

    #[test]
    fn stop_request_exits_before_the_next_step_and_still_saves() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), 4);

        let commands = TrainCommands::new();
        commands.stop();
        let (mut trainer, steps, saves) = build_trainer(dir.path(), 2, commands);
        trainer.start().unwrap();
        let outcome = trainer.train().unwrap();
        assert_eq!(outcome, TrainOutcome::Stopped);
        assert_eq!(steps.load(Ordering::SeqCst), 0);

        // backup_before_save defaults to on: the stopped run still saves.
        trainer.end(outcome).unwrap();
        assert_eq!(saves.lock().unwrap().len(), 1);
    }

    #[test]
    fn periodic_backups_land_in_the_backup_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), 2);

        let (mut trainer, _steps, saves) = build_trainer(dir.path(), 3, TrainCommands::new());
        trainer.config.backup_after_epochs = Some(2);
        trainer.start().unwrap();
        trainer.train().unwrap();

        let saves = saves.lock().unwrap();
        assert_eq!(saves.len(), 1);
        assert!(saves[0].ends_with("backup/epoch-2"));
    }
}

//! Assembles the dataset pipeline for fine tuning: the stage list is built
//! conditionally from the train config, then validated and wrapped in a
//! `TrainDataLoader`.

use std::sync::Arc;

use log::info;

use crate::config::{Concept, TrainConfig};
use crate::model::Vae;
use crate::pipeline::modules::{
    AspectBatchSorting, AspectBucketing, CalcAspect, CollectPaths, DecodeVae, DiskCache,
    DownscaleMask, EncodeVae, GenerateMaskedConditioningImage, LoadImage, LoadText, ModifyPath,
    OutputModule, RandomFlip, RandomMaskRotateCrop, SampleVaeDistribution, SaveImage,
    ScaleCropImage, SingleResolutionCalc,
};
use crate::pipeline::{DataPipeline, ModuleSlot, PipelineError, Stage, TrainDataLoader};

/// Spatial reduction of the VAE, pixel edge to latent edge.
const VAE_DOWNSCALE_FACTOR: usize = 8;

const MASK_POSTFIX: &str = "-masklabel";

/// Build the full dataset pipeline for the given config and concepts.
///
/// Stages are inserted or skipped per config flag; the pipeline constructor
/// re-checks the resulting dataflow, so a flag combination that starves a
/// module of its inputs fails here, before any epoch starts.
pub fn create_dataset(
    config: &TrainConfig,
    concepts: Vec<Concept>,
    vae: Arc<dyn Vae>,
) -> Result<TrainDataLoader, PipelineError> {
    let device = config
        .temp_device()
        .map_err(PipelineError::Capability)?;
    let masked = config.masked_training;
    let conditioned = config.model_type.has_conditioning_image_input();

    let enumerate: Stage = {
        let mut stage: Stage = vec![ModuleSlot::Source(Box::new(CollectPaths::new(concepts)))];
        if masked {
            stage.push(ModuleSlot::Map(Box::new(
                ModifyPath::new("image_path", "mask_path", MASK_POSTFIX, ".png")
                    .gated_by("concept_masking"),
            )));
        }
        if config.load_prompts {
            stage.push(ModuleSlot::Map(Box::new(ModifyPath::new(
                "image_path",
                "prompt_path",
                "",
                ".txt",
            ))));
        }
        stage
    };

    let load: Stage = {
        let mut stage: Stage = vec![ModuleSlot::Map(Box::new(LoadImage::new(
            "image_path",
            "image",
            -1.0,
            1.0,
        )))];
        if masked {
            // Concepts without mask files train unmasked: the fallback is an
            // all-ones mask shaped like the image.
            stage.push(ModuleSlot::Map(Box::new(
                LoadImage::new("mask_path", "mask", 0.0, 1.0)
                    .single_channel()
                    .with_fallback_like("image"),
            )));
        }
        if config.load_prompts {
            stage.push(ModuleSlot::Map(Box::new(LoadText::new(
                "prompt_path",
                "prompt",
                Some("concept"),
            ))));
        }
        stage
    };

    let augment: Stage = {
        let mut stage: Stage = Vec::new();
        if masked && config.random_rotate_and_crop {
            // Crops never shrink below the training resolution, so the later
            // scale step only ever downsamples.
            stage.push(ModuleSlot::Map(Box::new(RandomMaskRotateCrop::new(
                "mask",
                &["image"],
                config.resolution,
                10.0,
                30.0,
                20.0,
            ))));
        }
        stage
    };

    let bucket: Stage = {
        let mut stage: Stage = Vec::new();
        if config.aspect_ratio_bucketing {
            stage.push(ModuleSlot::Map(Box::new(CalcAspect::new(
                "image",
                "original_resolution",
            ))));
            stage.push(ModuleSlot::Map(Box::new(AspectBucketing::new(
                config.resolution,
                "original_resolution",
                "scale_resolution",
                "crop_resolution",
            ))));
        } else {
            stage.push(ModuleSlot::Map(Box::new(SingleResolutionCalc::new(
                "image",
                "scale_resolution",
                "crop_resolution",
                config.resolution,
            ))));
        }
        stage.push(ModuleSlot::Map(Box::new(ScaleCropImage::new(
            "image",
            "scale_resolution",
            "crop_resolution",
            "image",
        ))));
        if masked {
            stage.push(ModuleSlot::Map(Box::new(ScaleCropImage::new(
                "mask",
                "scale_resolution",
                "crop_resolution",
                "mask",
            ))));
        }
        // Flips run on the already-cropped frame.
        let mut flip_names = vec!["image"];
        if masked {
            flip_names.push("mask");
        }
        stage.push(ModuleSlot::Map(Box::new(RandomFlip::new(&flip_names, 0.5))));
        if conditioned {
            stage.push(ModuleSlot::Map(Box::new(
                GenerateMaskedConditioningImage::new("image", "mask", "conditioning_image"),
            )));
        }
        stage
    };

    let encode: Stage = {
        let mut stage: Stage = vec![ModuleSlot::Map(Box::new(EncodeVae::new(
            "image",
            "latent_image_distribution",
            vae.clone(),
        )))];
        if masked {
            stage.push(ModuleSlot::Map(Box::new(DownscaleMask::new(
                "mask",
                "latent_mask",
                VAE_DOWNSCALE_FACTOR,
            ))));
        }
        if conditioned {
            stage.push(ModuleSlot::Map(Box::new(EncodeVae::new(
                "conditioning_image",
                "latent_conditioning_image_distribution",
                vae.clone(),
            ))));
        }
        stage
    };

    let cache: Option<Stage> = if config.latent_caching {
        let cache_dir = config.cache_dir.clone().ok_or_else(|| {
            PipelineError::Config("latent_caching requires cache_dir".into())
        })?;
        let mut split = vec!["latent_image_distribution"];
        if masked {
            split.push("latent_mask");
        }
        if conditioned {
            split.push("latent_conditioning_image_distribution");
        }
        let mut aggregate = vec!["crop_resolution", "image_path"];
        if config.load_prompts {
            aggregate.push("prompt");
        }
        Some(vec![ModuleSlot::Cache(DiskCache::new(
            cache_dir,
            &split,
            &aggregate,
            config.latent_caching_epochs,
            device.clone(),
        ))])
    } else {
        None
    };

    let sample: Stage = {
        let mut stage: Stage = vec![ModuleSlot::Map(Box::new(SampleVaeDistribution::new(
            "latent_image_distribution",
            "latent_image",
            config.latent_sample_mode,
        )))];
        if conditioned {
            stage.push(ModuleSlot::Map(Box::new(SampleVaeDistribution::new(
                "latent_conditioning_image_distribution",
                "latent_conditioning_image",
                config.latent_sample_mode,
            ))));
        }
        stage
    };

    let output: Stage = {
        let mut names = vec!["latent_image", "image_path"];
        if !config.latent_caching {
            names.push("image");
        }
        if masked {
            names.push("latent_mask");
        }
        if conditioned {
            names.push("latent_conditioning_image");
        }
        if config.load_prompts {
            names.push("prompt");
        }
        vec![
            ModuleSlot::Sort(AspectBatchSorting::new("crop_resolution")),
            ModuleSlot::Output(OutputModule::new(&names)),
        ]
    };

    let debug: Option<Stage> = if config.debug_mode {
        let debug_dir = config
            .debug_dir
            .clone()
            .unwrap_or_else(|| config.workspace_dir.join("debug"))
            .join("dataset");
        let mut stage: Stage = vec![
            ModuleSlot::Map(Box::new(DecodeVae::new(
                "latent_image",
                "decoded_image",
                vae,
            ))),
            ModuleSlot::Map(Box::new(SaveImage::new(
                "decoded_image",
                debug_dir.clone(),
                -1.0,
                1.0,
            ))),
        ];
        if masked {
            stage.push(ModuleSlot::Map(Box::new(SaveImage::new(
                "latent_mask",
                debug_dir,
                0.0,
                1.0,
            ))));
        }
        Some(stage)
    } else {
        None
    };

    let stages: Vec<Option<Stage>> = vec![
        Some(enumerate),
        Some(load),
        Some(augment),
        Some(bucket),
        Some(encode),
        cache,
        Some(sample),
        Some(output),
        debug,
    ];

    let pipeline = DataPipeline::new(stages, device, config.seed)?;
    info!(
        "dataset pipeline assembled: masked={masked} bucketing={} caching={}",
        config.aspect_ratio_bucketing, config.latent_caching
    );
    Ok(TrainDataLoader::new(pipeline, config.batch_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LatentDistribution;
    use crate::progress::TrainProgress;
    use anyhow::Result as AnyResult;
    use candle_core::Tensor;
    use image::{Rgb, RgbImage};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Pixel-space average pooling stands in for a real VAE.
    struct PoolingVae {
        encode_calls: AtomicUsize,
    }

    impl PoolingVae {
        fn new() -> Self {
            Self {
                encode_calls: AtomicUsize::new(0),
            }
        }
    }

    impl Vae for PoolingVae {
        fn encode(&self, image: &Tensor) -> AnyResult<LatentDistribution> {
            self.encode_calls.fetch_add(1, Ordering::SeqCst);
            let mean = image.avg_pool2d(8)?;
            let logvar = mean.zeros_like()?;
            Ok(LatentDistribution::new(mean, logvar))
        }

        fn decode(&self, latent: &Tensor) -> AnyResult<Tensor> {
            Ok(latent.upsample_nearest2d(latent.dim(2)? * 8, latent.dim(3)? * 8)?)
        }

        fn scaling_factor(&self) -> f64 {
            0.18215
        }
    }

    fn write_png(dir: &Path, name: &str, w: u32, h: u32, shade: u8) {
        let img = RgbImage::from_pixel(w, h, Rgb([shade, shade / 2, 255 - shade]));
        img.save(dir.join(name)).unwrap();
    }

    fn test_config(concept_dir: &Path) -> TrainConfig {
        let yaml = format!(
            "model_type: sd15\nconcept_file_name: {0}/concepts.json\nworkspace_dir: {0}\nbatch_size: 2\nresolution: 128\n",
            concept_dir.display()
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn test_concepts(dir: &Path) -> Vec<Concept> {
        vec![Concept {
            name: "test subject".to_string(),
            path: dir.to_path_buf(),
            enable_masking: true,
            include_subdirectories: false,
        }]
    }

    #[test]
    fn ten_images_batch_two_yield_five_uniform_batches() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..10 {
            write_png(dir.path(), &format!("img{i:02}.png"), 128, 128, 20 * i as u8);
        }

        let config = test_config(dir.path());
        let mut loader =
            create_dataset(&config, test_concepts(dir.path()), Arc::new(PoolingVae::new()))
                .unwrap();

        let progress = TrainProgress::default();
        loader.start_epoch(&progress).unwrap();
        assert_eq!(loader.batch_count(), 5);

        let mut batches = 0;
        while let Some(batch) = loader.next_batch() {
            let batch = batch.unwrap();
            assert_eq!(batch.len(), 2);
            assert_eq!(batch.tensor("image").unwrap().dims(), &[2, 3, 128, 128]);
            assert_eq!(batch.tensor("latent_image").unwrap().dims(), &[2, 3, 16, 16]);
            assert_eq!(batch.paths("image_path").unwrap().len(), 2);
            assert!(!batch.contains("mask"));
            assert!(!batch.contains("latent_mask"));
            batches += 1;
        }
        assert_eq!(batches, 5);
    }

    #[test]
    fn incomplete_final_batch_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..7 {
            write_png(dir.path(), &format!("img{i}.png"), 128, 128, 30 * i as u8);
        }

        let config = test_config(dir.path());
        let mut loader =
            create_dataset(&config, test_concepts(dir.path()), Arc::new(PoolingVae::new()))
                .unwrap();
        loader.start_epoch(&TrainProgress::default()).unwrap();
        assert_eq!(loader.batch_count(), 3);
    }

    #[test]
    fn bucketing_keeps_batches_shape_homogeneous() {
        let dir = tempfile::tempdir().unwrap();
        // Two landscape, two portrait; bucketing must never mix them.
        write_png(dir.path(), "land0.png", 256, 128, 10);
        write_png(dir.path(), "land1.png", 256, 128, 60);
        write_png(dir.path(), "port0.png", 128, 256, 110);
        write_png(dir.path(), "port1.png", 128, 256, 160);

        let mut config = test_config(dir.path());
        config.aspect_ratio_bucketing = true;
        let mut loader =
            create_dataset(&config, test_concepts(dir.path()), Arc::new(PoolingVae::new()))
                .unwrap();
        loader.start_epoch(&TrainProgress::default()).unwrap();
        assert_eq!(loader.batch_count(), 2);

        while let Some(batch) = loader.next_batch() {
            let batch = batch.unwrap();
            let dims = batch.tensor("image").unwrap().dims().to_vec();
            assert_eq!(dims[0], 2);
            // Within the batch both samples share one bucket shape, and the
            // bucket keeps the dominant orientation.
            let paths = batch.paths("image_path").unwrap();
            let landscape = dims[3] > dims[2];
            for path in paths {
                let name = path.file_name().unwrap().to_str().unwrap();
                assert_eq!(name.starts_with("land"), landscape);
            }
        }
    }

    #[test]
    fn masked_training_emits_downscaled_masks() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png", 128, 128, 100);
        write_png(dir.path(), "b.png", 128, 128, 200);
        // Only `a` has a mask; `b` falls back to all ones.
        let mask = image::GrayImage::from_pixel(128, 128, image::Luma([255u8]));
        mask.save(dir.path().join("a-masklabel.png")).unwrap();

        let mut config = test_config(dir.path());
        config.masked_training = true;
        let mut loader =
            create_dataset(&config, test_concepts(dir.path()), Arc::new(PoolingVae::new()))
                .unwrap();
        loader.start_epoch(&TrainProgress::default()).unwrap();

        let batch = loader.next_batch().unwrap().unwrap();
        let mask = batch.tensor("latent_mask").unwrap();
        assert_eq!(mask.dims(), &[2, 1, 16, 16]);
        let values = mask.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (*v - 1.0).abs() < 1e-5));
    }

    #[test]
    fn latent_caching_skips_reencoding_on_the_next_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            write_png(dir.path(), &format!("img{i}.png"), 128, 128, 50 * i as u8);
        }

        let mut config = test_config(dir.path());
        config.latent_caching = true;
        config.latent_caching_epochs = 10;
        config.cache_dir = Some(cache_dir.path().to_path_buf());

        let vae = Arc::new(PoolingVae::new());
        let mut loader =
            create_dataset(&config, test_concepts(dir.path()), vae.clone()).unwrap();

        let mut progress = TrainProgress::default();
        loader.start_epoch(&progress).unwrap();
        while let Some(batch) = loader.next_batch() {
            batch.unwrap();
        }
        let after_first = vae.encode_calls.load(Ordering::SeqCst);
        assert_eq!(after_first, 4);

        progress.next_epoch();
        loader.start_epoch(&progress).unwrap();
        while let Some(batch) = loader.next_batch() {
            let batch = batch.unwrap();
            // Cached epochs skip the image pathway entirely.
            assert!(!batch.contains("image"));
            assert_eq!(batch.tensor("latent_image").unwrap().dims(), &[2, 3, 16, 16]);
        }
        assert_eq!(vae.encode_calls.load(Ordering::SeqCst), after_first);
    }

    #[test]
    fn start_epoch_without_cache_defers_encoding_to_the_pull() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..6 {
            write_png(dir.path(), &format!("img{i}.png"), 128, 128, 40 * i as u8);
        }

        let config = test_config(dir.path());
        let vae = Arc::new(PoolingVae::new());
        let mut loader = create_dataset(&config, test_concepts(dir.path()), vae.clone()).unwrap();

        loader.start_epoch(&TrainProgress::default()).unwrap();
        // Epoch start only buckets; no sample has been through the VAE yet.
        assert_eq!(vae.encode_calls.load(Ordering::SeqCst), 0);

        loader.next_batch().unwrap().unwrap();
        assert_eq!(vae.encode_calls.load(Ordering::SeqCst), 2);

        while let Some(batch) = loader.next_batch() {
            batch.unwrap();
        }
        assert_eq!(vae.encode_calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn sample_vanishing_mid_epoch_is_dropped_from_its_batch() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            write_png(dir.path(), &format!("img{i}.png"), 128, 128, 50 * i as u8);
        }

        let mut config = test_config(dir.path());
        config.latent_caching = true;
        config.cache_dir = Some(cache_dir.path().to_path_buf());

        let mut loader =
            create_dataset(&config, test_concepts(dir.path()), Arc::new(PoolingVae::new()))
                .unwrap();
        loader.start_epoch(&TrainProgress::default()).unwrap();
        assert_eq!(loader.batch_count(), 2);

        // One sample loses both its cache artifacts and its source image
        // after the epoch was laid out.
        std::fs::remove_file(dir.path().join("img1.png")).unwrap();
        for entry in std::fs::read_dir(cache_dir.path()).unwrap() {
            let path = entry.unwrap().path();
            if path.file_name().unwrap().to_str().unwrap().contains("img1") {
                std::fs::remove_file(path).unwrap();
            }
        }

        let mut samples = 0;
        while let Some(batch) = loader.next_batch() {
            samples += batch.unwrap().len();
        }
        assert_eq!(samples, 3);
    }

    #[test]
    fn concepts_with_masking_disabled_ignore_mask_files() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png", 128, 128, 100);
        write_png(dir.path(), "b.png", 128, 128, 200);
        // An all-zero mask file exists for `a` but the concept opted out, so
        // it must not be read.
        let mask = image::GrayImage::from_pixel(128, 128, image::Luma([0u8]));
        mask.save(dir.path().join("a-masklabel.png")).unwrap();

        let mut config = test_config(dir.path());
        config.masked_training = true;
        let mut concepts = test_concepts(dir.path());
        concepts[0].enable_masking = false;

        let mut loader =
            create_dataset(&config, concepts, Arc::new(PoolingVae::new())).unwrap();
        loader.start_epoch(&TrainProgress::default()).unwrap();

        let batch = loader.next_batch().unwrap().unwrap();
        let mask = batch.tensor("latent_mask").unwrap();
        let values = mask.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (*v - 1.0).abs() < 1e-5));
    }

    #[test]
    fn rotate_crop_feeds_resolution_sized_batches() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..2 {
            write_png(dir.path(), &format!("img{i}.png"), 192, 192, 80 * i as u8);
        }
        let mask = image::GrayImage::from_pixel(192, 192, image::Luma([255u8]));
        mask.save(dir.path().join("img0-masklabel.png")).unwrap();
        mask.save(dir.path().join("img1-masklabel.png")).unwrap();

        let mut config = test_config(dir.path());
        config.masked_training = true;
        config.random_rotate_and_crop = true;

        let mut loader =
            create_dataset(&config, test_concepts(dir.path()), Arc::new(PoolingVae::new()))
                .unwrap();
        loader.start_epoch(&TrainProgress::default()).unwrap();

        let batch = loader.next_batch().unwrap().unwrap();
        // Crops are floored at the training resolution, so the scale step
        // never has to upsample to reach the bucket shape.
        assert_eq!(batch.tensor("image").unwrap().dims(), &[2, 3, 128, 128]);
        assert_eq!(batch.tensor("latent_mask").unwrap().dims(), &[2, 1, 16, 16]);
    }

    #[test]
    fn resuming_mid_epoch_replays_the_same_remaining_batches() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..8 {
            write_png(dir.path(), &format!("img{i}.png"), 128, 128, 25 * i as u8);
        }
        let config = test_config(dir.path());

        // First run: consume two batches, remember the rest.
        let mut first =
            create_dataset(&config, test_concepts(dir.path()), Arc::new(PoolingVae::new()))
                .unwrap();
        let mut progress = TrainProgress::default();
        first.start_epoch(&progress).unwrap();
        for _ in 0..2 {
            let batch = first.next_batch().unwrap().unwrap();
            progress.next_step(batch.len());
        }
        let mut expected: Vec<Vec<String>> = Vec::new();
        while let Some(batch) = first.next_batch() {
            let batch = batch.unwrap();
            expected.push(
                batch
                    .paths("image_path")
                    .unwrap()
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect(),
            );
        }

        // Second run resumes from the recorded progress and must see the
        // identical tail, in order.
        let mut second =
            create_dataset(&config, test_concepts(dir.path()), Arc::new(PoolingVae::new()))
                .unwrap();
        second.start_epoch(&progress).unwrap();
        let mut resumed: Vec<Vec<String>> = Vec::new();
        while let Some(batch) = second.next_batch() {
            let batch = batch.unwrap();
            resumed.push(
                batch
                    .paths("image_path")
                    .unwrap()
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect(),
            );
        }
        assert_eq!(expected, resumed);
    }

    #[test]
    fn undecodable_image_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            write_png(dir.path(), &format!("img{i}.png"), 128, 128, 40 * i as u8);
        }
        std::fs::write(dir.path().join("broken.png"), b"not an image").unwrap();

        let config = test_config(dir.path());
        let mut loader =
            create_dataset(&config, test_concepts(dir.path()), Arc::new(PoolingVae::new()))
                .unwrap();
        loader.start_epoch(&TrainProgress::default()).unwrap();
        // 4 good images at batch size 2.
        assert_eq!(loader.batch_count(), 2);
    }

    #[test]
    fn starved_module_fails_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        // Inpainting without masked training leaves the conditioning module
        // without a mask input.
        config.model_type = crate::config::ModelType::Sd15Inpainting;
        let result = create_dataset(&config, test_concepts(dir.path()), Arc::new(PoolingVae::new()));
        assert!(matches!(result, Err(PipelineError::UnsatisfiedInput { .. })));
    }
}

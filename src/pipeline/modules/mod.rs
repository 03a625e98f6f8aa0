//! The transformation modules the dataset pipeline is composed of.

pub mod augment;
pub mod bucket;
pub mod cache;
pub mod collect;
pub mod debug;
pub mod encode;
pub mod load;
pub mod output;

pub use augment::{GenerateMaskedConditioningImage, RandomFlip, RandomMaskRotateCrop};
pub use bucket::{AspectBucketing, CalcAspect, ScaleCropImage, SingleResolutionCalc};
pub use cache::DiskCache;
pub use collect::{CollectPaths, ModifyPath};
pub use debug::{DecodeVae, SaveImage};
pub use encode::{DownscaleMask, EncodeVae, SampleVaeDistribution};
pub use load::{LoadImage, LoadText};
pub use output::{AspectBatchSorting, OutputModule};

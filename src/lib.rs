pub mod config;
pub mod data_loader;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod trainers;

// Re-export common types
pub use config::{load_concepts, Concept, ModelType, TrainConfig};
pub use data_loader::create_dataset;
pub use model::StableDiffusionModel;
pub use pipeline::TrainDataLoader;
pub use progress::TrainProgress;
pub use trainers::FineTuneTrainer;

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    pub fn init_logger(level: LevelFilter) {
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, level)
            .init();
    }
}

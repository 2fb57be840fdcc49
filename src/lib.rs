pub mod model;
pub mod trainstep;

// Re-export common types
pub use model::{
    Denoiser, LatentDecoder, ModelComponents, ModelVariant, TextEncoder, TrainBatch,
    TrainProgress,
};
pub use trainstep::{
    load_config, AlignPropConfig, AttentionBackend, BetaScheduleKind, GuidedRolloutEngine,
    LossType, ModelOutputData, NoiseSchedule, PredictionType, TrainDtype, TrainStepConfig,
    TrainStepOrchestrator,
};

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    pub fn init_logger() {
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
            .filter(None, LevelFilter::Info)
            .init();
    }
}

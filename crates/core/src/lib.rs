pub mod config;
pub mod config_loader;
pub mod config_watcher;
pub mod error;
pub mod events;
pub mod kelly;
pub mod oracle;
pub mod position;
pub mod position_sizing;
pub mod traits;

pub use config::{
    AssignmentConfig, BandMultiplier, LadderConfig, LadderLimits, RollTriggerConfig, SchedulerConfig,
    SizingConfig, ThetaSmoothingConfig, TierBands,
};
pub use config_loader::ConfigLoader;
pub use config_watcher::ConfigWatcher;
pub use error::{ErrorCode, LadderError, LadderResult};
pub use events::{EventBus, PositionEvent};
pub use kelly::KellySizer;
pub use oracle::{
    score_with_fallback, MarketContext, Recommendation, ResonanceGrade, ScoringOracle,
    SimulatedOracle, StaticOracle, TemporalScore,
};
pub use position::{Band, Position, PositionStatus, Side};
pub use position_sizing::{band_multiplier, compute_size, edge_multiplier, nearest_band, SizeBreakdown};
pub use traits::{Clock, IdSource, ManualClock, SequentialIdSource, SystemClock, UuidIdSource};

pub mod ladder;
pub mod registry;

pub use ladder::{Ladder, LadderMember, LadderMetrics, RollRecord};
pub use registry::{Assignment, LadderRegistry, RegistrySnapshot, SymbolSummary};

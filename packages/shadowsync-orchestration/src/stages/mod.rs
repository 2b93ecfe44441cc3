// Stage implementations, in pipeline order
pub mod raw_ingest;
pub mod cascade;
pub mod shadow;
pub mod membership;
pub mod real_sync;
pub mod update_fields;
pub mod aggregate;

// Re-exports
pub use aggregate::{AggregateCommand, AggregateRegistry, AggregateStage, DownstreamAggregates};
pub use cascade::{CascadeDepth, InvalidationCascade};
pub use membership::MembershipPopulator;
pub use raw_ingest::{IngestScope, RawIngestStage};
pub use real_sync::RealSynchronizer;
pub use shadow::ShadowPopulator;
pub use update_fields::FieldUpdater;

pub(crate) use crate::snapshot::canonical_key;

use std::sync::Arc;

use crate::pipeline::StageHandler;

/// The eight stages, in [`crate::job::Stage`] order.
pub fn default_stages(aggregates: Arc<AggregateRegistry>) -> Vec<Box<dyn StageHandler>> {
    vec![
        Box::new(RawIngestStage::created()),
        Box::new(InvalidationCascade::new()),
        Box::new(RawIngestStage::modified()),
        Box::new(ShadowPopulator::new()),
        Box::new(MembershipPopulator::new()),
        Box::new(RealSynchronizer::new()),
        Box::new(FieldUpdater::new()),
        Box::new(DownstreamAggregates::new(aggregates)),
    ]
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Stage;

    #[test]
    fn test_default_stages_follow_stage_order() {
        let stages: Vec<Stage> = default_stages(Arc::new(AggregateRegistry::new()))
            .iter()
            .map(|s| s.stage())
            .collect();
        assert_eq!(stages, Stage::ALL.to_vec());
    }
}

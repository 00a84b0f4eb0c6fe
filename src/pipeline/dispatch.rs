//! Dispatcher: channel allocation plan and partition routing.
//!
//! For every enabled hop the dispatcher resolves both copy counts, decides
//! whether rows must be repartitioned, classifies the hop and lists one
//! channel per concrete `(producer copy, consumer copy)` pair:
//!
//! | dispatch | channels                         |
//! |----------|----------------------------------|
//! | 1 → 1    | `(0, 0)`                         |
//! | 1 → N    | `(0, j)` for every consumer copy |
//! | N → 1    | `(i, 0)` for every producer copy |
//! | N → N    | `(i, i)`                         |
//! | N → M    | every `(i, j)`                   |
//!
//! N → M is used whenever the copy counts differ (both above one) or the hop
//! repartitions rows.

use crate::config::VariableResolver;
use crate::error::{EngineError, Result};
use crate::pipeline::definition::{PartitionMethod, PipelineDefinition, RowDistribution, StageDefinition};
use crate::pipeline::id::{CopyKey, StageId};
use crate::pipeline::runtime::Routing;
use std::fmt;

/// Cardinality class of one hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchType {
    OneToOne,
    OneToN,
    NToOne,
    NToN,
    NToM,
}

impl fmt::Display for DispatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispatchType::OneToOne => "1:1",
            DispatchType::OneToN => "1:N",
            DispatchType::NToOne => "N:1",
            DispatchType::NToN => "N:N",
            DispatchType::NToM => "N:M",
        };
        f.write_str(s)
    }
}

/// Classify a hop from its copy counts. Both counts must be at least one.
pub fn classify(producers: usize, consumers: usize, repartitioning: bool) -> DispatchType {
    if producers == 1 && consumers == 1 {
        DispatchType::OneToOne
    } else if producers == 1 {
        DispatchType::OneToN
    } else if consumers == 1 {
        DispatchType::NToOne
    } else if producers == consumers && !repartitioning {
        DispatchType::NToN
    } else {
        DispatchType::NToM
    }
}

/// `(producer copy, consumer copy)` pairs for a dispatch type.
pub fn copy_pairs(kind: DispatchType, producers: usize, consumers: usize) -> Vec<(usize, usize)> {
    match kind {
        DispatchType::OneToOne => vec![(0, 0)],
        DispatchType::OneToN => (0..consumers).map(|c| (0, c)).collect(),
        DispatchType::NToOne => (0..producers).map(|p| (p, 0)).collect(),
        DispatchType::NToN => (0..producers).map(|c| (c, c)).collect(),
        DispatchType::NToM => (0..producers)
            .flat_map(|p| (0..consumers).map(move |c| (p, c)))
            .collect(),
    }
}

/// Rows must be redistributed between partitions on this hop.
///
/// A partitioned producer repartitions unless the consumer uses the same
/// partitioning; an unpartitioned producer repartitions into a partitioned
/// consumer.
pub fn needs_repartitioning(producer: &StageDefinition, consumer: &StageDefinition) -> bool {
    match (producer.active_partitioning(), consumer.active_partitioning()) {
        (Some(p), Some(c)) => p != c,
        (Some(_), None) | (None, Some(_)) => true,
        (None, None) => false,
    }
}

/// Routing a producer applies to rows sent to one consumer.
///
/// An explicit target partitioning on the producer wins. Otherwise a
/// repartitioning hop into a partitioned consumer uses the consumer's method,
/// and every other hop uses the producer's row distribution.
pub fn routing_for(producer: &StageDefinition, consumer: &StageDefinition) -> Routing {
    let spec = producer
        .target_partitioning
        .as_ref()
        .filter(|s| s.is_partitioned())
        .or_else(|| {
            if needs_repartitioning(producer, consumer) {
                consumer.active_partitioning()
            } else {
                None
            }
        });

    match spec.map(|s| (s.method, s.field)) {
        Some((PartitionMethod::Mod, field)) => Routing::Mod { field },
        Some((PartitionMethod::Mirror, _)) => Routing::Mirror,
        _ => match producer.distribution {
            RowDistribution::RoundRobin => Routing::RoundRobin,
            RowDistribution::Copy => Routing::Copy,
        },
    }
}

/// One channel to allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPlan {
    pub from: CopyKey,
    pub to: CopyKey,
    /// Carries error rows to the producer's error target
    pub error: bool,
    pub routing: Routing,
}

/// Planned dispatch of one hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopDispatch {
    pub from: StageId,
    pub to: StageId,
    pub kind: DispatchType,
    pub repartitioning: bool,
    pub channels: usize,
}

/// The complete allocation plan.
#[derive(Debug, Clone, Default)]
pub struct DispatchPlan {
    /// Resolved copy count per stage, indexed by `StageId`
    pub copies: Vec<usize>,
    pub hops: Vec<HopDispatch>,
    pub channels: Vec<ChannelPlan>,
}

impl DispatchPlan {
    pub fn copies_of(&self, id: StageId) -> usize {
        self.copies.get(id.index()).copied().unwrap_or(0)
    }

    pub fn total_copies(&self) -> usize {
        self.copies.iter().sum()
    }
}

/// Resolve copy counts and plan every channel of `def`.
pub fn plan(def: &PipelineDefinition, variables: &dyn VariableResolver) -> Result<DispatchPlan> {
    let mut copies = Vec::with_capacity(def.stages.len());
    for stage in &def.stages {
        let n = stage.resolve_copies(variables)?;
        if n < 0 {
            return Err(EngineError::Config(format!(
                "stage '{}' resolved to {} copies, which is not allowed",
                stage.name, n
            )));
        }
        copies.push(n as usize);
    }

    let mut plan = DispatchPlan {
        copies,
        ..Default::default()
    };

    for (i, producer) in def.stages.iter().enumerate() {
        let from = StageId(i as u32);
        if producer.embedding {
            continue;
        }
        for to in def.next_stages(from) {
            let consumer = def.get(to);
            if consumer.embedding {
                continue;
            }

            let p = plan.copies_of(from);
            let c = plan.copies_of(to);
            if p == 0 || c == 0 {
                continue;
            }

            let repartitioning = needs_repartitioning(producer, consumer);
            let kind = classify(p, c, repartitioning);
            let pairs = copy_pairs(kind, p, c);
            let error = producer
                .error_target
                .as_deref()
                .map(|t| t.eq_ignore_ascii_case(&consumer.name))
                .unwrap_or(false);
            let routing = routing_for(producer, consumer);

            plan.hops.push(HopDispatch {
                from,
                to,
                kind,
                repartitioning,
                channels: pairs.len(),
            });
            plan.channels.extend(pairs.into_iter().map(|(pc, cc)| ChannelPlan {
                from: CopyKey::new(producer.name.clone(), pc),
                to: CopyKey::new(consumer.name.clone(), cc),
                error,
                routing,
            }));
        }
    }

    Ok(plan)
}

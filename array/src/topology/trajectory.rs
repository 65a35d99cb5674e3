use crate::ids::DetectorId;
use std::collections::BTreeSet;

/// Chain of detectors crossed along one line of flight, furthest from the target first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trajectory {
    nodes: Vec<DetectorId>,
}

impl Trajectory {
    pub(crate) fn new(nodes: Vec<DetectorId>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[DetectorId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, detector: DetectorId) -> bool {
        self.nodes.contains(&detector)
    }

    pub fn furthest(&self) -> Option<DetectorId> {
        self.nodes.first().copied()
    }

    pub fn nearest(&self) -> Option<DetectorId> {
        self.nodes.last().copied()
    }

    /// The part of the trajectory from `detector` to the target.
    pub fn tail_from(&self, detector: DetectorId) -> Option<&[DetectorId]> {
        let position = self.nodes.iter().position(|node| *node == detector)?;
        self.nodes.get(position..)
    }

    fn is_sub_path_of(&self, other: &Trajectory) -> bool {
        self.len() < other.len()
            && other
                .nodes
                .windows(self.len())
                .any(|window| window == self.nodes.as_slice())
    }
}

/// Turns the chains crossed by a set of scan directions into trajectories.
///
/// Each chain is given nearest-first, as returned by a propagation query. Empty and
/// repeated chains are ignored and a chain contained contiguously in a longer one is
/// dropped.
pub(crate) fn trajectories_from_chains<I>(chains: I) -> Vec<Trajectory>
where
    I: IntoIterator<Item = Vec<DetectorId>>,
{
    let distinct: BTreeSet<Vec<DetectorId>> = chains
        .into_iter()
        .filter(|chain| !chain.is_empty())
        .map(|mut chain| {
            chain.reverse();
            chain
        })
        .collect();
    let candidates: Vec<Trajectory> = distinct.into_iter().map(Trajectory::new).collect();
    candidates
        .iter()
        .filter(|trajectory| {
            !candidates
                .iter()
                .any(|other| trajectory.is_sub_path_of(other))
        })
        .cloned()
        .collect()
}

/// A trajectory tail used to reconstruct particles stopping at its first detector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconstructionTrajectory {
    name: String,
    nodes: Vec<DetectorId>,
}

impl ReconstructionTrajectory {
    pub(crate) fn new(name: String, nodes: Vec<DetectorId>) -> Self {
        Self { name, nodes }
    }

    /// Detector names joined by `/`, stopping detector first.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[DetectorId] {
        &self.nodes
    }

    pub fn stopping_detector(&self) -> Option<DetectorId> {
        self.nodes.first().copied()
    }
}

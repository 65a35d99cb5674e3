use super::Trajectory;
use crate::ids::{DetectorId, GroupId, TrajectoryId};

/// Detectors connected through overlapping trajectories; particles in different groups
/// never share a detector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    id: GroupId,
    detectors: Vec<DetectorId>,
    trajectories: Vec<TrajectoryId>,
}

impl Group {
    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn detectors(&self) -> &[DetectorId] {
        &self.detectors
    }

    pub fn trajectories(&self) -> &[TrajectoryId] {
        &self.trajectories
    }

    pub fn contains(&self, detector: DetectorId) -> bool {
        self.detectors.binary_search(&detector).is_ok()
    }
}

/// Partitions `detector_count` detectors into groups.
///
/// `detector_trajectories` lists for every detector the trajectories passing through it.
pub(crate) fn build_groups(
    trajectories: &[Trajectory],
    detector_trajectories: &[Vec<TrajectoryId>],
) -> Vec<Group> {
    let mut visited = vec![false; detector_trajectories.len()];
    let mut groups = Vec::new();

    for start in 0..detector_trajectories.len() {
        if visited.get(start).copied().unwrap_or(true) {
            continue;
        }
        let mut detectors = Vec::new();
        let mut group_trajectories = Vec::new();
        let mut worklist = vec![DetectorId(start)];
        while let Some(detector) = worklist.pop() {
            let Some(seen) = visited.get_mut(detector.index()) else {
                continue;
            };
            if *seen {
                continue;
            }
            *seen = true;
            detectors.push(detector);
            for trajectory in detector_trajectories
                .get(detector.index())
                .into_iter()
                .flatten()
            {
                if group_trajectories.contains(trajectory) {
                    continue;
                }
                group_trajectories.push(*trajectory);
                if let Some(trajectory) = trajectories.get(trajectory.index()) {
                    worklist.extend(trajectory.nodes().iter().copied());
                }
            }
        }
        detectors.sort();
        group_trajectories.sort();
        groups.push(Group {
            id: GroupId(groups.len()),
            detectors,
            trajectories: group_trajectories,
        });
    }
    groups
}

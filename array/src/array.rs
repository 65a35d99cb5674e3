//! The detector array: owns every detector and the structures derived from their
//! geometry, and is passed explicitly to everything that needs it.
use crate::{
    calibration::Calibrator,
    detector::{Detector, DetectorConfig, DetectorError},
    ids::{DetectorId, GroupId, TelescopeId, TrajectoryId},
    material::{AbsorberError, MaterialTable},
    signal::{SignalError, SignalRegistry},
    target::{Target, TargetConfig, TargetOrientation},
    topology::{
        Group, ReconstructionTrajectory, RegistryError, Telescope, TelescopeConfig,
        TelescopeRegistry, Trajectory, build_groups, candidate_keys, generic, telescope_name,
        trajectories_from_chains,
    },
};
use itertools::Itertools;
use serde::Deserialize;
use std::{collections::HashMap, fs, path::Path};
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_SCAN_STEPS: usize = 8;

#[derive(Debug, Error)]
pub enum ArrayError {
    #[error("Array has no detectors")]
    NoDetectors,
    #[error("Detector name {0} is used more than once")]
    DuplicateDetector(String),
    #[error("{0}")]
    Detector(#[from] DetectorError),
    #[error("{0}")]
    Registry(#[from] RegistryError),
    #[error("Target: {0}")]
    Target(#[from] AbsorberError),
    #[error("Cannot read array configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid array configuration: {0}")]
    Json(#[from] serde_json::Error),
}

fn default_scan_steps() -> usize {
    DEFAULT_SCAN_STEPS
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArrayConfig {
    pub name: String,
    pub dataset: Option<String>,
    pub detectors: Vec<DetectorConfig>,
    #[serde(default)]
    pub telescopes: Vec<TelescopeConfig>,
    pub target: Option<TargetConfig>,
    /// Directions per side of the grid scanned across each detector to find trajectories.
    #[serde(default = "default_scan_steps")]
    pub scan_steps: usize,
}

/// Assembles a [DetectorArray] from detectors built in code.
#[derive(Debug)]
pub struct ArrayBuilder {
    name: String,
    dataset: Option<String>,
    detectors: Vec<Detector>,
    registry: TelescopeRegistry,
    target: Option<Target>,
    scan_steps: usize,
}

impl ArrayBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            dataset: None,
            detectors: Vec::new(),
            registry: TelescopeRegistry::default(),
            target: None,
            scan_steps: DEFAULT_SCAN_STEPS,
        }
    }

    pub fn dataset(mut self, dataset: &str) -> Self {
        self.dataset = Some(dataset.to_owned());
        self
    }

    pub fn detector(mut self, detector: Detector) -> Self {
        self.detectors.push(detector);
        self
    }

    pub fn telescope(mut self, key: &str, kind: &str) -> Result<Self, ArrayError> {
        self.registry.register_key(key, kind)?;
        Ok(self)
    }

    pub fn registry(mut self, registry: TelescopeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn scan_steps(mut self, scan_steps: usize) -> Self {
        self.scan_steps = scan_steps.max(1);
        self
    }

    pub fn build(self) -> Result<DetectorArray, ArrayError> {
        if self.detectors.is_empty() {
            return Err(ArrayError::NoDetectors);
        }
        let mut by_name = HashMap::with_capacity(self.detectors.len());
        for (index, detector) in self.detectors.iter().enumerate() {
            if by_name
                .insert(detector.name().to_owned(), DetectorId(index))
                .is_some()
            {
                return Err(ArrayError::DuplicateDetector(detector.name().to_owned()));
            }
        }
        let mut array = DetectorArray {
            name: self.name,
            dataset: self.dataset,
            detectors: self.detectors,
            by_name,
            trajectories: Vec::new(),
            reconstruction_trajectories: Vec::new(),
            telescopes: Vec::new(),
            telescope_by_name: HashMap::new(),
            groups: Vec::new(),
            target: self.target,
        };
        array.build_trajectories(self.scan_steps);
        array.build_reconstruction_trajectories();
        array.build_telescopes(&self.registry);
        array.build_groups();
        info!(
            "Array {}: {} detectors, {} trajectories, {} telescopes, {} groups",
            array.name,
            array.detectors.len(),
            array.trajectories.len(),
            array.telescopes.len(),
            array.groups.len()
        );
        Ok(array)
    }
}

#[derive(Clone, Debug)]
pub struct DetectorArray {
    name: String,
    dataset: Option<String>,
    detectors: Vec<Detector>,
    by_name: HashMap<String, DetectorId>,
    trajectories: Vec<Trajectory>,
    /// Indexed by detector.
    reconstruction_trajectories: Vec<Vec<ReconstructionTrajectory>>,
    telescopes: Vec<Telescope>,
    telescope_by_name: HashMap<String, TelescopeId>,
    groups: Vec<Group>,
    target: Option<Target>,
}

impl DetectorArray {
    pub fn from_config(config: &ArrayConfig) -> Result<Self, ArrayError> {
        let table = MaterialTable::standard();
        let mut registry = TelescopeRegistry::default();
        registry.register_all(&config.telescopes)?;
        let mut builder = config.detectors.iter().try_fold(
            ArrayBuilder::new(&config.name)
                .registry(registry)
                .scan_steps(config.scan_steps),
            |builder, detector| {
                Ok::<_, ArrayError>(builder.detector(Detector::from_config(detector, table)?))
            },
        )?;
        if let Some(dataset) = &config.dataset {
            builder = builder.dataset(dataset);
        }
        if let Some(target) = &config.target {
            builder = builder.target(Target::from_config(target, table)?);
        }
        builder.build()
    }

    pub fn from_file(path: &Path) -> Result<Self, ArrayError> {
        let config: ArrayConfig = serde_json::from_str(&fs::read_to_string(path)?)?;
        Self::from_config(&config)
    }

    fn crossed_by(detectors: &[Detector], theta: f64, phi: f64) -> Vec<DetectorId> {
        detectors
            .iter()
            .enumerate()
            .filter(|(_, detector)| detector.geometry().contains(theta, phi))
            .sorted_by(|(_, a), (_, b)| {
                a.geometry()
                    .distance_cm
                    .total_cmp(&b.geometry().distance_cm)
                    .then_with(|| a.name().cmp(b.name()))
            })
            .map(|(index, _)| DetectorId(index))
            .collect()
    }

    fn build_trajectories(&mut self, scan_steps: usize) {
        let chains = self
            .detectors
            .iter()
            .flat_map(|detector| {
                let geometry = detector.geometry();
                geometry
                    .scan_directions(scan_steps)
                    .map(|(theta, phi)| Self::crossed_by(&self.detectors, theta, phi))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        self.trajectories = trajectories_from_chains(chains);

        for (index, trajectory) in self.trajectories.iter().enumerate() {
            for node in trajectory.nodes() {
                if let Some(detector) = self.detectors.get_mut(node.index()) {
                    detector.trajectories.push(TrajectoryId(index));
                }
            }
            for (far, near) in trajectory.nodes().iter().tuple_windows() {
                if let Some(detector) = self.detectors.get_mut(far.index()) {
                    if !detector.in_front.contains(near) {
                        detector.in_front.push(*near);
                    }
                }
                if let Some(detector) = self.detectors.get_mut(near.index()) {
                    if !detector.behind.contains(far) {
                        detector.behind.push(*far);
                    }
                }
            }
        }
        debug!("Found {} trajectories", self.trajectories.len());
    }

    fn build_reconstruction_trajectories(&mut self) {
        self.reconstruction_trajectories = self
            .detectors
            .iter()
            .enumerate()
            .map(|(index, detector)| {
                detector
                    .trajectories()
                    .iter()
                    .filter_map(|id| self.trajectories.get(id.index()))
                    .filter_map(|trajectory| trajectory.tail_from(DetectorId(index)))
                    .unique()
                    .map(|tail| {
                        let name = tail
                            .iter()
                            .filter_map(|id| self.detectors.get(id.index()))
                            .map(Detector::name)
                            .join("/");
                        ReconstructionTrajectory::new(name, tail.to_vec())
                    })
                    .collect()
            })
            .collect();
    }

    fn members(&self, ids: &[DetectorId]) -> Vec<&Detector> {
        ids.iter()
            .filter_map(|id| self.detectors.get(id.index()))
            .collect()
    }

    /// Returns the telescope made of `ids`, creating it if needed. Without a registered
    /// factory a generic telescope is created only when `generic_fallback` is set.
    fn ensure_telescope(
        &mut self,
        ids: Vec<DetectorId>,
        registry: &TelescopeRegistry,
        generic_fallback: bool,
    ) -> Option<TelescopeId> {
        let members = self.members(&ids);
        let name = telescope_name(&members);
        if let Some(id) = self.telescope_by_name.get(&name) {
            return Some(*id);
        }
        let keys = candidate_keys(&self.name, self.dataset.as_deref(), &members);
        let telescope = match registry.lookup(&keys) {
            Some((key, factory)) => {
                debug!("Telescope {name} built from key {key}");
                factory(&name, ids.clone())
            }
            None if generic_fallback => {
                debug!("No telescope registered for {}", keys.join(", "));
                generic(&name, ids.clone())
            }
            None => return None,
        };
        let id = TelescopeId(self.telescopes.len());
        self.telescopes.push(telescope);
        self.telescope_by_name.insert(name, id);
        for member in ids {
            if let Some(detector) = self.detectors.get_mut(member.index()) {
                detector.telescopes.push(id);
            }
        }
        Some(id)
    }

    fn build_telescopes(&mut self, registry: &TelescopeRegistry) {
        let trajectories = self.trajectories.clone();
        for trajectory in &trajectories {
            let nodes = trajectory.nodes();
            for (index, back) in nodes.iter().enumerate() {
                let members = match nodes.get(index + 1) {
                    Some(front) => vec![*front, *back],
                    None => vec![*back],
                };
                self.ensure_telescope(members, registry, true);
            }
        }
        for index in 0..self.detectors.len() {
            self.ensure_telescope(vec![DetectorId(index)], registry, false);
        }
    }

    fn build_groups(&mut self) {
        let detector_trajectories = self
            .detectors
            .iter()
            .map(|detector| detector.trajectories().to_vec())
            .collect::<Vec<_>>();
        self.groups = build_groups(&self.trajectories, &detector_trajectories);
        for group in &self.groups {
            for id in group.detectors() {
                if let Some(detector) = self.detectors.get_mut(id.index()) {
                    detector.group = Some(group.id());
                }
            }
        }
        for telescope in &mut self.telescopes {
            telescope.group = telescope
                .back()
                .and_then(|id| self.detectors.get(id.index()))
                .and_then(Detector::group);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dataset(&self) -> Option<&str> {
        self.dataset.as_deref()
    }

    pub fn detectors(&self) -> &[Detector] {
        &self.detectors
    }

    pub fn detector_ids(&self) -> impl Iterator<Item = DetectorId> + '_ {
        (0..self.detectors.len()).map(DetectorId)
    }

    pub fn detector(&self, id: DetectorId) -> Option<&Detector> {
        self.detectors.get(id.index())
    }

    pub fn detector_id(&self, name: &str) -> Option<DetectorId> {
        self.by_name.get(name).copied()
    }

    pub fn detector_by_name(&self, name: &str) -> Option<&Detector> {
        self.detector_id(name).and_then(|id| self.detector(id))
    }

    pub fn trajectories(&self) -> &[Trajectory] {
        &self.trajectories
    }

    pub fn trajectory(&self, id: TrajectoryId) -> Option<&Trajectory> {
        self.trajectories.get(id.index())
    }

    pub fn telescopes(&self) -> &[Telescope] {
        &self.telescopes
    }

    pub fn telescope(&self, id: TelescopeId) -> Option<&Telescope> {
        self.telescopes.get(id.index())
    }

    pub fn telescope_by_name(&self, name: &str) -> Option<&Telescope> {
        self.telescope_by_name
            .get(name)
            .and_then(|id| self.telescope(*id))
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(id.index())
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn set_target(&mut self, target: Target) {
        self.target = Some(target);
    }

    /// Has no effect when the array has no target.
    pub fn set_target_orientation(&mut self, orientation: TargetOrientation) {
        if let Some(target) = &mut self.target {
            target.set_orientation(orientation);
        }
    }

    /// Every detector whose window contains the direction, nearest first.
    pub fn crossed_detectors(&self, theta: f64, phi: f64) -> Vec<DetectorId> {
        Self::crossed_by(&self.detectors, theta, phi)
    }

    /// Trajectory tails starting at `detector`.
    pub fn reconstruction_trajectories(&self, detector: DetectorId) -> &[ReconstructionTrajectory] {
        self.reconstruction_trajectories
            .get(detector.index())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether `chain`, stopping detector first, is the tail of a trajectory.
    pub fn is_trajectory_tail(&self, chain: &[DetectorId]) -> bool {
        chain.first().is_some_and(|first| {
            self.reconstruction_trajectories(*first)
                .iter()
                .any(|trajectory| trajectory.nodes() == chain)
        })
    }

    /// The telescope identifying particles stopping in the first detector of `chain`:
    /// the pair it forms with the next detector if there is one, itself otherwise.
    pub fn identifying_telescope(&self, chain: &[DetectorId]) -> Option<TelescopeId> {
        let members = match chain {
            [] => return None,
            [single] => vec![*single],
            [back, front, ..] => vec![*front, *back],
        };
        let name = telescope_name(&self.members(&members));
        self.telescope_by_name.get(&name).copied().or_else(|| {
            let single = telescope_name(&self.members(chain.get(..1).unwrap_or_default()));
            self.telescope_by_name.get(&single).copied()
        })
    }

    pub fn signals_mut(&mut self, detector: DetectorId) -> Option<&mut SignalRegistry> {
        self.detectors
            .get_mut(detector.index())
            .map(Detector::signals_mut)
    }

    pub fn add_calibrator(
        &mut self,
        detector: DetectorId,
        calibrator: Calibrator,
    ) -> Result<(), SignalError> {
        let name = detector.to_string();
        self.signals_mut(detector)
            .ok_or(SignalError::Unknown(name))?
            .add_calibrator(calibrator)
    }

    /// Fresh per-event copies of every detector's signals.
    pub fn signal_values(&self) -> SignalValues {
        SignalValues {
            registries: self
                .detectors
                .iter()
                .map(|detector| detector.signals().clone())
                .collect(),
        }
    }
}

/// Signal values of one event, indexed by detector.
#[derive(Clone, Debug, Default)]
pub struct SignalValues {
    registries: Vec<SignalRegistry>,
}

impl SignalValues {
    pub fn get(&self, detector: DetectorId) -> Option<&SignalRegistry> {
        self.registries.get(detector.index())
    }

    pub fn get_mut(&mut self, detector: DetectorId) -> Option<&mut SignalRegistry> {
        self.registries.get_mut(detector.index())
    }

    pub fn clear(&mut self) {
        self.registries.iter_mut().for_each(SignalRegistry::clear);
    }

    pub fn fired_detectors(&self) -> impl Iterator<Item = DetectorId> + '_ {
        self.registries
            .iter()
            .enumerate()
            .filter(|(_, registry)| registry.is_fired())
            .map(|(index, _)| DetectorId(index))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        detector::DetectorGeometry,
        material::{Absorber, MaterialTable},
        topology::IdentificationMethod,
    };

    fn single_layer(
        name: &str,
        type_label: &str,
        material: &str,
        thickness_um: f64,
        theta: (f64, f64),
        phi: (f64, f64),
        distance_cm: f64,
    ) -> Detector {
        let material = MaterialTable::standard().lookup(material).unwrap();
        Detector::new(
            name,
            type_label,
            vec![Absorber::from_micrometres(material, thickness_um)],
            0,
            DetectorGeometry::new(theta, phi, distance_cm),
        )
        .unwrap()
    }

    /// A gas chamber covering two silicons, each backed by one CsI, plus an isolated
    /// silicon at backward angles.
    pub(crate) fn test_array() -> DetectorArray {
        ArrayBuilder::new("RING")
            .detector(single_layer("CI_01", "CI", "C4H10", 50.0, (10.0, 20.0), (0.0, 60.0), 10.0))
            .detector(single_layer("SI_01", "SI", "Si", 300.0, (10.0, 20.0), (0.0, 30.0), 20.0))
            .detector(single_layer("SI_02", "SI", "Si", 300.0, (10.0, 20.0), (30.0, 60.0), 20.0))
            .detector(single_layer("CSI_01", "CSI", "CsI", 100_000.0, (10.0, 20.0), (0.0, 30.0), 25.0))
            .detector(single_layer("CSI_02", "CSI", "CsI", 100_000.0, (10.0, 20.0), (30.0, 60.0), 25.0))
            .detector(single_layer("SI_99", "SI", "Si", 500.0, (120.0, 140.0), (0.0, 60.0), 15.0))
            .telescope("RING.SI-CSI", "delta-e-e")
            .unwrap()
            .telescope("RING.CI-SI", "delta-e-e-z-only")
            .unwrap()
            .telescope("RING.SI500", "z-minimum")
            .unwrap()
            .scan_steps(6)
            .build()
            .unwrap()
    }

    fn id(array: &DetectorArray, name: &str) -> DetectorId {
        array.detector_id(name).unwrap()
    }

    #[test]
    fn crossed_detectors_nearest_first() {
        let array = test_array();
        assert_eq!(
            array.crossed_detectors(15.0, 45.0),
            vec![id(&array, "CI_01"), id(&array, "SI_02"), id(&array, "CSI_02")]
        );
        assert!(array.crossed_detectors(60.0, 10.0).is_empty());
    }

    #[test]
    fn trajectories_and_relations() {
        let array = test_array();
        assert_eq!(array.trajectories().len(), 3);
        let csi = array.detector_by_name("CSI_01").unwrap();
        assert_eq!(csi.in_front(), &[id(&array, "SI_01")]);
        let ci = array.detector_by_name("CI_01").unwrap();
        assert_eq!(ci.behind().len(), 2);
        assert_eq!(ci.trajectories().len(), 2);

        let tails = array.reconstruction_trajectories(id(&array, "SI_01"));
        assert_eq!(tails.len(), 1);
        assert_eq!(tails[0].name(), "SI_01/CI_01");
        assert!(array.is_trajectory_tail(&[id(&array, "CSI_02"), id(&array, "SI_02"), id(&array, "CI_01")]));
        assert!(!array.is_trajectory_tail(&[id(&array, "CSI_02"), id(&array, "CI_01")]));
    }

    #[test]
    fn telescopes_follow_the_registry() {
        let array = test_array();
        let si_csi = array.telescope_by_name("ID_SI_01_CSI_01").unwrap();
        assert!(si_csi.is_ready());
        assert_eq!(si_csi.method(), IdentificationMethod::DeltaEE { mass_id: true });
        let ci_si = array.telescope_by_name("ID_CI_01_SI_02").unwrap();
        assert!(!ci_si.has_mass_identification());
        let ci = array.telescope_by_name("ID_CI_01").unwrap();
        assert!(!ci.is_ready());
        let backward = array.telescope_by_name("ID_SI_99").unwrap();
        assert_eq!(backward.method(), IdentificationMethod::ZMinimum);
        // The innermost telescope is shared by both trajectories through the chamber
        assert_eq!(
            array
                .telescopes()
                .iter()
                .filter(|telescope| telescope.name() == "ID_CI_01")
                .count(),
            1
        );
        assert!(array.telescope_by_name("ID_SI_01").is_none());

        let chain = [id(&array, "CSI_01"), id(&array, "SI_01"), id(&array, "CI_01")];
        let telescope = array.identifying_telescope(&chain).unwrap();
        assert_eq!(array.telescope(telescope).unwrap().name(), "ID_SI_01_CSI_01");
    }

    #[test]
    fn groups_partition_detectors() {
        let array = test_array();
        assert_eq!(array.groups().len(), 2);
        let ring = array.detector_by_name("CSI_02").unwrap().group().unwrap();
        assert_eq!(array.group(ring).unwrap().detectors().len(), 5);
        let backward = array.detector_by_name("SI_99").unwrap().group().unwrap();
        assert_ne!(ring, backward);
        for telescope in array.telescopes() {
            for member in telescope.detectors() {
                assert_eq!(array.detector(*member).unwrap().group(), telescope.group());
            }
        }
    }

    #[test]
    fn structural_errors() {
        assert!(matches!(ArrayBuilder::new("EMPTY").build(), Err(ArrayError::NoDetectors)));
        let duplicate = ArrayBuilder::new("DUP")
            .detector(single_layer("SI_01", "SI", "Si", 300.0, (10.0, 20.0), (0.0, 30.0), 20.0))
            .detector(single_layer("SI_01", "SI", "Si", 300.0, (20.0, 30.0), (0.0, 30.0), 20.0))
            .build();
        assert!(matches!(duplicate, Err(ArrayError::DuplicateDetector(name)) if name == "SI_01"));
        assert!(matches!(
            ArrayBuilder::new("BAD").telescope("BAD.SI", "unknown"),
            Err(ArrayError::Registry(_))
        ));
    }

    #[test]
    fn array_from_json() {
        let config: ArrayConfig = serde_json::from_str(
            r#"{
                "name": "WALL",
                "dataset": "e503",
                "detectors": [
                    { "name": "SI_A", "type": "SI", "threshold-mev": 0.5,
                      "layers": [ { "material": "Si", "thickness-um": 150, "active": true } ],
                      "geometry": { "theta-min": 5, "theta-max": 10, "phi-min": 0, "phi-max": 360, "distance-cm": 30 } },
                    { "name": "CSI_A", "type": "CSI",
                      "layers": [ { "material": "CsI", "thickness-cm": 10, "active": true } ],
                      "geometry": { "theta-min": 5, "theta-max": 10, "phi-min": 0, "phi-max": 360, "distance-cm": 35 } }
                ],
                "telescopes": [ { "key": "e503.WALL.SI-CSI", "kind": "delta-e-e" } ],
                "target": { "material": "Sn", "area-density": 0.35 }
            }"#,
        )
        .unwrap();
        let array = DetectorArray::from_config(&config).unwrap();
        assert_eq!(array.dataset(), Some("e503"));
        assert!(array.telescope_by_name("ID_SI_A_CSI_A").unwrap().is_ready());
        assert_eq!(array.target().unwrap().orientation(), None);
        assert_eq!(array.detector_by_name("SI_A").unwrap().threshold(), 0.5);

        let mut array = array;
        array.set_target_orientation(TargetOrientation::Incoming);
        assert_eq!(
            array.target().unwrap().orientation(),
            Some(TargetOrientation::Incoming)
        );
    }
}

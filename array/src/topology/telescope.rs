use crate::{
    detector::Detector,
    ids::{DetectorId, GroupId},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// How a telescope identifies the particles stopping in it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
pub enum IdentificationMethod {
    /// Energy loss in the front member against the energy of the back member.
    DeltaEE { mass_id: bool },
    /// Lower bound on Z from the largest energy loss possible in the front member.
    ZMinimum,
    NotIdentifying,
}

/// One or two detectors used together to identify a particle.
#[derive(Clone, Debug, PartialEq)]
pub struct Telescope {
    name: String,
    /// Front member first.
    detectors: Vec<DetectorId>,
    kind: String,
    method: IdentificationMethod,
    ready: bool,
    pub(crate) group: Option<GroupId>,
}

impl Telescope {
    pub fn new(name: &str, detectors: Vec<DetectorId>, kind: &str, method: IdentificationMethod) -> Self {
        Self {
            name: name.to_owned(),
            detectors,
            kind: kind.to_owned(),
            method,
            ready: !matches!(method, IdentificationMethod::NotIdentifying),
            group: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn detectors(&self) -> &[DetectorId] {
        &self.detectors
    }

    pub fn size(&self) -> usize {
        self.detectors.len()
    }

    /// The member nearest the target.
    pub fn front(&self) -> Option<DetectorId> {
        self.detectors.first().copied()
    }

    /// The member particles identified by this telescope stop in.
    pub fn back(&self) -> Option<DetectorId> {
        self.detectors.last().copied()
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn method(&self) -> IdentificationMethod {
        self.method
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn has_mass_identification(&self) -> bool {
        matches!(self.method, IdentificationMethod::DeltaEE { mass_id: true })
    }

    pub fn group(&self) -> Option<GroupId> {
        self.group
    }
}

/// Builds a telescope from its name and members.
pub type TelescopeFactory = fn(&str, Vec<DetectorId>) -> Telescope;

pub const GENERIC_KIND: &str = "generic";

fn delta_e_e(name: &str, detectors: Vec<DetectorId>) -> Telescope {
    Telescope::new(name, detectors, "delta-e-e", IdentificationMethod::DeltaEE { mass_id: true })
}

fn delta_e_e_z_only(name: &str, detectors: Vec<DetectorId>) -> Telescope {
    Telescope::new(
        name,
        detectors,
        "delta-e-e-z-only",
        IdentificationMethod::DeltaEE { mass_id: false },
    )
}

fn z_minimum(name: &str, detectors: Vec<DetectorId>) -> Telescope {
    Telescope::new(name, detectors, "z-minimum", IdentificationMethod::ZMinimum)
}

fn not_identifying(name: &str, detectors: Vec<DetectorId>) -> Telescope {
    Telescope::new(name, detectors, "not-identifying", IdentificationMethod::NotIdentifying)
}

pub(crate) fn generic(name: &str, detectors: Vec<DetectorId>) -> Telescope {
    Telescope::new(name, detectors, GENERIC_KIND, IdentificationMethod::NotIdentifying)
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Unknown telescope kind '{kind}' for key '{key}'")]
    UnknownKind { key: String, kind: String },
}

/// Telescope association of the array configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TelescopeConfig {
    pub key: String,
    pub kind: String,
}

/// Maps telescope keys of the form `[dataset.]array.typeA[thicknessA]-typeB[thicknessB]`
/// to the factory building telescopes of that kind.
#[derive(Clone, Debug)]
pub struct TelescopeRegistry {
    factories: HashMap<&'static str, TelescopeFactory>,
    keys: HashMap<String, &'static str>,
}

impl Default for TelescopeRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
            keys: HashMap::new(),
        };
        registry.register_kind("delta-e-e", delta_e_e);
        registry.register_kind("delta-e-e-z-only", delta_e_e_z_only);
        registry.register_kind("z-minimum", z_minimum);
        registry.register_kind("not-identifying", not_identifying);
        registry
    }
}

impl TelescopeRegistry {
    pub fn register_kind(&mut self, kind: &'static str, factory: TelescopeFactory) {
        self.factories.insert(kind, factory);
    }

    /// Associates a key with a registered kind.
    pub fn register_key(&mut self, key: &str, kind: &str) -> Result<(), RegistryError> {
        let (kind, _) = self
            .factories
            .get_key_value(kind)
            .ok_or_else(|| RegistryError::UnknownKind {
                key: key.to_owned(),
                kind: kind.to_owned(),
            })?;
        self.keys.insert(key.to_owned(), kind);
        Ok(())
    }

    pub fn register_all(&mut self, telescopes: &[TelescopeConfig]) -> Result<(), RegistryError> {
        telescopes
            .iter()
            .try_for_each(|telescope| self.register_key(&telescope.key, &telescope.kind))
    }

    fn factory(&self, key: &str) -> Option<TelescopeFactory> {
        self.keys
            .get(key)
            .and_then(|kind| self.factories.get(kind))
            .copied()
    }

    /// The first registered key among the candidates, with its factory.
    pub fn lookup(&self, candidates: &[String]) -> Option<(&str, TelescopeFactory)> {
        candidates.iter().find_map(|key| {
            let (key, _) = self.keys.get_key_value(key.as_str())?;
            self.factory(key)
                .map(|factory| (key.as_str(), factory))
        })
    }
}

fn member_label(detector: &Detector, with_thickness: bool) -> String {
    if with_thickness {
        format!("{}{}", detector.type_label(), detector.active_thickness_um())
    } else {
        detector.type_label().to_owned()
    }
}

/// Keys under which a telescope made of `members` (front first) may be registered,
/// in order of precedence.
pub fn candidate_keys(array: &str, dataset: Option<&str>, members: &[&Detector]) -> Vec<String> {
    let body = |with_thickness: bool| {
        members
            .iter()
            .map(|detector| member_label(detector, with_thickness))
            .collect::<Vec<_>>()
            .join("-")
    };
    let mut keys = Vec::new();
    if let Some(dataset) = dataset {
        keys.push(format!("{dataset}.{array}.{}", body(true)));
        keys.push(format!("{dataset}.{array}.{}", body(false)));
    }
    keys.push(format!("{array}.{}", body(true)));
    keys.push(format!("{array}.{}", body(false)));

    let mut candidates = Vec::with_capacity(2 * keys.len());
    for key in keys {
        let upper = key.to_uppercase();
        if !candidates.contains(&key) {
            candidates.push(key);
        }
        if !candidates.contains(&upper) {
            candidates.push(upper);
        }
    }
    candidates
}

/// Name given to the telescope made of `members`, front first.
pub fn telescope_name(members: &[&Detector]) -> String {
    members.iter().fold("ID".to_owned(), |name, detector| {
        format!("{name}_{}", detector.name())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        detector::DetectorGeometry,
        material::{Absorber, MaterialTable},
    };

    fn detector(name: &str, type_label: &str, material: &str, thickness_um: f64) -> Detector {
        let material = MaterialTable::standard().lookup(material).unwrap();
        Detector::new(
            name,
            type_label,
            vec![Absorber::from_micrometres(material, thickness_um)],
            0,
            DetectorGeometry::new((10.0, 20.0), (0.0, 30.0), 50.0),
        )
        .unwrap()
    }

    #[test]
    fn candidate_key_precedence() {
        let si = detector("SI_01", "Si", "Si", 300.0);
        let csi = detector("CSI_01", "CsI", "CsI", 50_000.0);
        assert_eq!(
            candidate_keys("ARR", Some("e503"), &[&si, &csi]),
            vec![
                "e503.ARR.Si300-CsI50000",
                "E503.ARR.SI300-CSI50000",
                "e503.ARR.Si-CsI",
                "E503.ARR.SI-CSI",
                "ARR.Si300-CsI50000",
                "ARR.SI300-CSI50000",
                "ARR.Si-CsI",
                "ARR.SI-CSI",
            ]
        );
        assert_eq!(candidate_keys("ARR", None, &[&si]), vec!["ARR.Si300", "ARR.SI300", "ARR.Si", "ARR.SI"]);
        assert_eq!(telescope_name(&[&si, &csi]), "ID_SI_01_CSI_01");
    }

    #[test]
    fn lookup_prefers_the_most_specific_key() {
        let mut registry = TelescopeRegistry::default();
        registry.register_key("ARR.SI-CSI", "delta-e-e-z-only").unwrap();
        registry.register_key("E503.ARR.SI-CSI", "delta-e-e").unwrap();
        let si = detector("SI_01", "Si", "Si", 300.0);
        let csi = detector("CSI_01", "CsI", "CsI", 50_000.0);

        let (key, factory) = registry
            .lookup(&candidate_keys("ARR", Some("e503"), &[&si, &csi]))
            .unwrap();
        assert_eq!(key, "E503.ARR.SI-CSI");
        let telescope = factory("ID_SI_01_CSI_01", vec![DetectorId(0), DetectorId(1)]);
        assert!(telescope.is_ready());
        assert!(telescope.has_mass_identification());
        assert_eq!(telescope.front(), Some(DetectorId(0)));

        let (key, _) = registry
            .lookup(&candidate_keys("ARR", None, &[&si, &csi]))
            .unwrap();
        assert_eq!(key, "ARR.SI-CSI");
        assert!(registry.lookup(&candidate_keys("ARR", None, &[&csi])).is_none());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut registry = TelescopeRegistry::default();
        assert_eq!(
            registry.register_key("ARR.SI", "magic"),
            Err(RegistryError::UnknownKind {
                key: "ARR.SI".to_owned(),
                kind: "magic".to_owned()
            })
        );
    }

    #[test]
    fn generic_telescopes_are_not_ready() {
        let telescope = generic("ID_SI_01", vec![DetectorId(0)]);
        assert!(!telescope.is_ready());
        assert_eq!(telescope.kind(), GENERIC_KIND);
    }
}

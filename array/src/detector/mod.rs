//! Detectors: ordered absorber stacks with one active layer, a position in the array
//! and a set of signals.
mod geometry;

use crate::{
    ids::{DetectorId, GroupId, TelescopeId, TrajectoryId},
    material::{Absorber, AbsorberError, LayerConfig, MaterialTable, StoppingFunctions, energy_limit},
    signal::SignalRegistry,
};
pub use geometry::DetectorGeometry;
use multidet_common::{ChargeNumber, Energy, MassNumber};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DetectorError {
    #[error("Detector {0} has no absorber layers")]
    NoLayers(String),
    #[error("Detector {0} has no active layer")]
    NoActiveLayer(String),
    #[error("Detector {0} has more than one active layer")]
    SeveralActiveLayers(String),
    #[error("Detector {name}: {source}")]
    Layer { name: String, source: AbsorberError },
}

fn default_segmented() -> bool {
    true
}

/// Description of one detector as found in an array configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DetectorConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_label: String,
    pub layers: Vec<LayerConfig>,
    pub geometry: DetectorGeometry,
    #[serde(default)]
    pub threshold_mev: Energy,
    #[serde(default = "default_segmented")]
    pub segmented: bool,
    /// Raw signals read out from this detector.
    #[serde(default)]
    pub raw_signals: Vec<String>,
}

/// Energy lost in each layer of a detector by one ion.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerLosses {
    pub losses: Vec<Energy>,
    pub active_layer: usize,
    /// Kinetic energy left behind the last layer.
    pub residual: Energy,
}

impl LayerLosses {
    pub fn active(&self) -> Energy {
        self.losses.get(self.active_layer).copied().unwrap_or_default()
    }

    pub fn total(&self) -> Energy {
        self.losses.iter().sum()
    }

    pub fn punched_through(&self) -> bool {
        self.residual > 0.0
    }

    /// Index of the layer the ion stopped in.
    pub fn stopping_layer(&self) -> Option<usize> {
        if self.punched_through() {
            return None;
        }
        self.losses.iter().rposition(|loss| *loss > 0.0)
    }
}

#[derive(Clone, Debug)]
pub struct Detector {
    name: String,
    type_label: String,
    layers: Vec<Absorber>,
    active_layer: usize,
    geometry: DetectorGeometry,
    threshold: Energy,
    segmented: bool,
    signals: SignalRegistry,

    pub(crate) trajectories: Vec<TrajectoryId>,
    pub(crate) in_front: Vec<DetectorId>,
    pub(crate) behind: Vec<DetectorId>,
    pub(crate) telescopes: Vec<TelescopeId>,
    pub(crate) group: Option<GroupId>,
}

impl Detector {
    pub fn new(
        name: &str,
        type_label: &str,
        layers: Vec<Absorber>,
        active_layer: usize,
        geometry: DetectorGeometry,
    ) -> Result<Self, DetectorError> {
        if layers.is_empty() {
            return Err(DetectorError::NoLayers(name.to_owned()));
        }
        if active_layer >= layers.len() {
            return Err(DetectorError::NoActiveLayer(name.to_owned()));
        }
        Ok(Self {
            name: name.to_owned(),
            type_label: type_label.to_owned(),
            layers,
            active_layer,
            geometry,
            threshold: 0.0,
            segmented: true,
            signals: SignalRegistry::default(),
            trajectories: Vec::new(),
            in_front: Vec::new(),
            behind: Vec::new(),
            telescopes: Vec::new(),
            group: None,
        })
    }

    pub fn from_config(config: &DetectorConfig, table: &MaterialTable) -> Result<Self, DetectorError> {
        let layers = config
            .layers
            .iter()
            .map(|layer| Absorber::from_config(layer, table))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| DetectorError::Layer {
                name: config.name.clone(),
                source,
            })?;
        let mut active = config
            .layers
            .iter()
            .enumerate()
            .filter(|(_, layer)| layer.active)
            .map(|(index, _)| index);
        let active_layer = match (active.next(), active.next()) {
            (Some(index), None) => index,
            (Some(_), Some(_)) => return Err(DetectorError::SeveralActiveLayers(config.name.clone())),
            (None, _) if layers.is_empty() => return Err(DetectorError::NoLayers(config.name.clone())),
            (None, _) => return Err(DetectorError::NoActiveLayer(config.name.clone())),
        };
        let mut detector = Self::new(
            &config.name,
            &config.type_label,
            layers,
            active_layer,
            config.geometry.clone(),
        )?
        .with_threshold(config.threshold_mev)
        .with_segmented(config.segmented);
        for signal in &config.raw_signals {
            detector.signals.add_raw_signal(signal);
        }
        Ok(detector)
    }

    pub fn with_threshold(mut self, threshold: Energy) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_segmented(mut self, segmented: bool) -> Self {
        self.segmented = segmented;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_label(&self) -> &str {
        &self.type_label
    }

    pub fn layers(&self) -> &[Absorber] {
        &self.layers
    }

    pub fn active_layer_index(&self) -> usize {
        self.active_layer
    }

    pub fn active_layer(&self) -> Option<&Absorber> {
        self.layers.get(self.active_layer)
    }

    /// Thickness of the active layer rounded to the micrometre, as used in telescope keys.
    pub fn active_thickness_um(&self) -> u64 {
        self.active_layer()
            .map(|layer| layer.thickness_um().round() as u64)
            .unwrap_or_default()
    }

    pub fn geometry(&self) -> &DetectorGeometry {
        &self.geometry
    }

    pub fn threshold(&self) -> Energy {
        self.threshold
    }

    /// Independent detectors can identify a particle on their own.
    pub fn is_segmented(&self) -> bool {
        self.segmented
    }

    pub fn signals(&self) -> &SignalRegistry {
        &self.signals
    }

    pub(crate) fn signals_mut(&mut self) -> &mut SignalRegistry {
        &mut self.signals
    }

    pub fn trajectories(&self) -> &[TrajectoryId] {
        &self.trajectories
    }

    /// Detectors directly in front of this one, i.e. nearer the target.
    pub fn in_front(&self) -> &[DetectorId] {
        &self.in_front
    }

    /// Detectors directly behind this one.
    pub fn behind(&self) -> &[DetectorId] {
        &self.behind
    }

    pub fn telescopes(&self) -> &[TelescopeId] {
        &self.telescopes
    }

    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    fn front_layers(&self) -> &[Absorber] {
        self.layers.get(..self.active_layer).unwrap_or_default()
    }

    /// Energy leaving the given layers for an ion entering them with `e_inc`.
    fn fold_e_res(layers: &[Absorber], z: ChargeNumber, a: MassNumber, e_inc: Energy) -> Energy {
        layers
            .iter()
            .fold(e_inc, |energy, layer| layer.e_res(z, a, energy))
    }

    /// Incident energy in front of `layers` needed to leave `e_res` behind them.
    fn back_propagate(layers: &[Absorber], z: ChargeNumber, a: MassNumber, e_res: Energy) -> Energy {
        let mut energy = e_res;
        for layer in layers.iter().rev() {
            energy = match layer.solve_incident_energy_from_e_res(z, a, energy) {
                Ok(energy) => energy,
                Err(_) => return energy_limit(a),
            };
        }
        energy
    }

    /// Per-layer energy losses of an ion entering the detector with `e_inc`.
    pub fn layer_losses(&self, z: ChargeNumber, a: MassNumber, e_inc: Energy) -> LayerLosses {
        let mut energy = e_inc;
        let losses = self
            .layers
            .iter()
            .map(|layer| {
                let residual = layer.e_res(z, a, energy);
                let loss = energy - residual;
                energy = residual;
                loss
            })
            .collect();
        LayerLosses {
            losses,
            active_layer: self.active_layer,
            residual: energy,
        }
    }
}

impl StoppingFunctions for Detector {
    fn delta_e(&self, z: ChargeNumber, a: MassNumber, e_inc: Energy) -> Energy {
        let at_active = Self::fold_e_res(self.front_layers(), z, a, e_inc);
        self.active_layer()
            .map(|layer| layer.delta_e(z, a, at_active))
            .unwrap_or_default()
    }

    fn e_res(&self, z: ChargeNumber, a: MassNumber, e_inc: Energy) -> Energy {
        Self::fold_e_res(&self.layers, z, a, e_inc)
    }

    fn e_inc_of_max_delta_e(&self, z: ChargeNumber, a: MassNumber) -> Energy {
        let at_active = self
            .active_layer()
            .map(|layer| layer.e_inc_of_max_delta_e(z, a))
            .unwrap_or_default();
        Self::back_propagate(self.front_layers(), z, a, at_active)
    }

    fn punch_through_energy(&self, z: ChargeNumber, a: MassNumber) -> Energy {
        Self::back_propagate(&self.layers, z, a, 0.0)
    }

    fn threshold_energy(&self, z: ChargeNumber, a: MassNumber) -> Energy {
        if self.front_layers().is_empty() {
            0.0
        } else {
            Self::back_propagate(self.front_layers(), z, a, 0.0)
        }
    }
}

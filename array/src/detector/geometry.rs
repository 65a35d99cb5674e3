use serde::Deserialize;

const FULL_TURN: f64 = 360.0;

/// Angular window of a detector seen from the target, in degrees.
///
/// The azimuthal window runs from `phi-min` to `phi-max` counter-clockwise and may wrap
/// through 360°. The dead border is the frame of the detector: directions within it hit
/// the detector without depositing energy in its sensitive volume.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct DetectorGeometry {
    pub theta_min: f64,
    pub theta_max: f64,
    pub phi_min: f64,
    pub phi_max: f64,
    pub distance_cm: f64,
    #[serde(default)]
    pub dead_border_deg: f64,
}

impl DetectorGeometry {
    pub fn new(theta: (f64, f64), phi: (f64, f64), distance_cm: f64) -> Self {
        Self {
            theta_min: theta.0,
            theta_max: theta.1,
            phi_min: phi.0,
            phi_max: phi.1,
            distance_cm,
            dead_border_deg: 0.0,
        }
    }

    pub fn with_dead_border(mut self, dead_border_deg: f64) -> Self {
        self.dead_border_deg = dead_border_deg;
        self
    }

    pub fn is_full_ring(&self) -> bool {
        self.phi_max - self.phi_min >= FULL_TURN
    }

    pub fn phi_width(&self) -> f64 {
        if self.is_full_ring() {
            FULL_TURN
        } else {
            (self.phi_max - self.phi_min).rem_euclid(FULL_TURN)
        }
    }

    /// Azimuth measured from `phi-min`, in `[0, 360)`.
    fn phi_offset(&self, phi: f64) -> f64 {
        (phi - self.phi_min).rem_euclid(FULL_TURN)
    }

    pub fn contains(&self, theta: f64, phi: f64) -> bool {
        (self.theta_min..=self.theta_max).contains(&theta)
            && (self.is_full_ring() || self.phi_offset(phi) <= self.phi_width())
    }

    /// The direction hits the frame of the detector.
    pub fn in_dead_zone(&self, theta: f64, phi: f64) -> bool {
        if self.dead_border_deg <= 0.0 || !self.contains(theta, phi) {
            return false;
        }
        let border = self.dead_border_deg;
        let near_theta_edge =
            theta - self.theta_min < border || self.theta_max - theta < border;
        let near_phi_edge = !self.is_full_ring() && {
            let offset = self.phi_offset(phi);
            offset < border || self.phi_width() - offset < border
        };
        near_theta_edge || near_phi_edge
    }

    pub fn centre(&self) -> (f64, f64) {
        let theta = 0.5 * (self.theta_min + self.theta_max);
        let phi = (self.phi_min + 0.5 * self.phi_width()).rem_euclid(FULL_TURN);
        (theta, phi)
    }

    /// Cell centres of a `steps`×`steps` grid over the window.
    pub fn scan_directions(&self, steps: usize) -> impl Iterator<Item = (f64, f64)> + '_ {
        let steps = steps.max(1);
        let d_theta = (self.theta_max - self.theta_min) / steps as f64;
        let d_phi = self.phi_width() / steps as f64;
        (0..steps).flat_map(move |i| {
            (0..steps).map(move |j| {
                (
                    self.theta_min + (i as f64 + 0.5) * d_theta,
                    (self.phi_min + (j as f64 + 0.5) * d_phi).rem_euclid(FULL_TURN),
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_phi_window() {
        let geometry = DetectorGeometry::new((10.0, 20.0), (350.0, 10.0), 50.0);
        assert_eq!(geometry.phi_width(), 20.0);
        assert!(geometry.contains(15.0, 355.0));
        assert!(geometry.contains(15.0, 5.0));
        assert!(geometry.contains(15.0, -5.0));
        assert!(!geometry.contains(15.0, 20.0));
        assert!(!geometry.contains(25.0, 0.0));
        assert_eq!(geometry.centre(), (15.0, 0.0));
    }

    #[test]
    fn full_ring() {
        let geometry = DetectorGeometry::new((2.0, 3.0), (0.0, 360.0), 100.0);
        assert!(geometry.is_full_ring());
        assert!(geometry.contains(2.5, 123.0));
        assert_eq!(geometry.scan_directions(4).count(), 16);
    }

    #[test]
    fn dead_border() {
        let geometry =
            DetectorGeometry::new((10.0, 20.0), (0.0, 30.0), 50.0).with_dead_border(0.5);
        assert!(geometry.in_dead_zone(10.2, 15.0));
        assert!(geometry.in_dead_zone(15.0, 29.8));
        assert!(!geometry.in_dead_zone(15.0, 15.0));
        assert!(!geometry.in_dead_zone(25.0, 15.0));
    }

    #[test]
    fn scan_stays_inside() {
        let geometry = DetectorGeometry::new((10.0, 20.0), (340.0, 20.0), 50.0);
        assert!(
            geometry
                .scan_directions(5)
                .all(|(theta, phi)| geometry.contains(theta, phi))
        );
    }
}

use serde::Serialize;

/// How a reconstructed particle can be analysed given the other particles of its group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display, strum::IntoStaticStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "SCREAMING-KEBAB-CASE")]
pub(crate) enum AnalysisStatus {
    /// Every detector the identification uses belongs to this particle alone.
    Ok,
    /// Identified once the contributions of calibrated particles have been subtracted.
    OkAfterSubtraction,
    /// Identified on an equal share of the energy of a shared detector.
    OkAfterShare,
    /// Stopped in the first detector it reached.
    StopFirstStage,
    /// Shares a member of its identifying telescope with another uncertain particle.
    PileupDeltaE,
    /// Everything it fired is accounted for by other particles.
    PileupGhost,
}

impl AnalysisStatus {
    pub(crate) fn code(&self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::OkAfterSubtraction => 1,
            Self::OkAfterShare => 2,
            Self::StopFirstStage => 3,
            Self::PileupDeltaE => 4,
            Self::PileupGhost => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_labels() {
        assert_eq!(AnalysisStatus::Ok.code(), 0);
        assert_eq!(AnalysisStatus::StopFirstStage.code(), 3);
        assert_eq!(
            AnalysisStatus::OkAfterSubtraction.to_string(),
            "OK-AFTER-SUBTRACTION"
        );
        assert_eq!(
            serde_json::to_string(&AnalysisStatus::PileupDeltaE).unwrap(),
            r#""pileup-delta-e""#
        );
    }
}

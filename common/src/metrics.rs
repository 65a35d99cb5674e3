use metrics::{describe_gauge, gauge};

pub fn component_info_metric(name: &'static str) {
    static NAME: &str = "multidet_component_info";

    describe_gauge!(NAME, "Basic information about the component");

    let git_rev = option_env!("GIT_VERSION").unwrap_or("unknown");
    gauge!(NAME, "component" => name, "git_version" => git_rev).set(1);
}

pub mod names {
    use const_format::concatcp;

    pub const METRIC_NAME_PREFIX: &str = "multidet_";

    pub const FAILURES: &str = concatcp!(METRIC_NAME_PREFIX, "failures");
    pub const EVENTS_PROCESSED: &str = concatcp!(METRIC_NAME_PREFIX, "events_processed");
    pub const PARTICLES_SIMULATED: &str = concatcp!(METRIC_NAME_PREFIX, "particles_simulated");
    pub const DETECTION_OUTCOMES: &str = concatcp!(METRIC_NAME_PREFIX, "detection_outcomes");
    pub const PARTICLES_RECONSTRUCTED: &str =
        concatcp!(METRIC_NAME_PREFIX, "particles_reconstructed");
    pub const IDENTIFICATION_CODES: &str = concatcp!(METRIC_NAME_PREFIX, "identification_codes");
    pub const COHERENCY_PASSES: &str = concatcp!(METRIC_NAME_PREFIX, "coherency_passes");
}

pub mod detection_outcome {
    // Label building function
    pub fn get_label(outcome: &'static str) -> (&'static str, &'static str) {
        ("outcome", outcome)
    }
}

pub mod identification_code {
    // Label building function
    pub fn get_label(code: &'static str) -> (&'static str, &'static str) {
        ("code", code)
    }
}

pub mod failures {
    #[derive(Debug, Clone, Eq, Hash, PartialEq)]
    pub enum FailureKind {
        CalibrationUnavailable,
        InversionFailed,
        GeometryIncoherency,
        MalformedEvent,
        FileWriteFailed,
    }

    // Label building function
    pub fn get_label(failure_kind: FailureKind) -> (&'static str, &'static str) {
        (
            "failure_kind",
            match failure_kind {
                FailureKind::CalibrationUnavailable => "calibration_unavailable",
                FailureKind::InversionFailed => "inversion_failed",
                FailureKind::GeometryIncoherency => "geometry_incoherency",
                FailureKind::MalformedEvent => "malformed_event",
                FailureKind::FileWriteFailed => "file_write_failed",
            },
        )
    }
}

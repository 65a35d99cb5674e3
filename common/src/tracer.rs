use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

pub struct TracerOptions {
    /// Level used when `RUST_LOG` is not set.
    pub default_level: LevelFilter,
    /// Emit ANSI colour codes, disable when writing logs to a file.
    pub ansi: bool,
}

impl Default for TracerOptions {
    fn default() -> Self {
        Self {
            default_level: LevelFilter::INFO,
            ansi: true,
        }
    }
}

/// Owns the global tracing subscriber of a component.
pub struct TracerEngine {
    service_name: String,
}

impl TracerEngine {
    /// Initialises the stderr tracer for the component.
    /// Standard output is left free for data produced by the binaries.
    /// #Arguments
    /// * `options` - The caller-specified instance of TracerOptions.
    /// * `service_name` - The name of the calling component.
    pub fn new(options: TracerOptions, service_name: &str) -> Self {
        let log_filter = EnvFilter::builder()
            .with_default_directive(options.default_level.into())
            .from_env_lossy();

        let stderr_tracer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(options.ansi)
            .with_target(true);

        let subscriber =
            tracing_subscriber::Registry::default().with(stderr_tracer.with_filter(log_filter));

        // A second initialisation (e.g. from tests) keeps the first subscriber.
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            tracing::debug!("Global tracing subscriber already set");
        }

        Self {
            service_name: service_name.to_owned(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

/// Should be called at the start of each component.
#[macro_export]
macro_rules! init_tracer {
    ($options:expr) => {{
        let tracer = $crate::tracer::TracerEngine::new($options, env!("CARGO_BIN_NAME"));
        tracing::info!("Starting {}", tracer.service_name());
        tracer
    }};
}

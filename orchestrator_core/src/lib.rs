//! This crate contains core functionality for Trainyard orchestrator crates: the durable job
//! record store and the object-storage client shared by the orchestration pipelines.

pub mod blobstore;
pub mod datastore;

/// These boundaries are intended to be able to capture the length of short-lived operations
/// (e.g. HTTP requests) as well as longer-running operations.
pub const TIME_HISTOGRAM_BOUNDARIES: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 90.0, 300.0,
];

#[cfg(feature = "test-util")]
pub mod test_util {
    use std::sync::Arc;

    use opentelemetry::{
        InstrumentationScope,
        metrics::{InstrumentProvider, Meter, MeterProvider},
    };

    pub fn noop_meter() -> Meter {
        NoopMeterProvider::new().meter("trainyard_orchestrator")
    }

    // TODO(https://github.com/open-telemetry/opentelemetry-rust/issues/2444): Version 0.27 of
    // `opentelemetry` removed `NoopMeterProvider` from the public API. The implementation is copied
    // below until it is added back to a future version.

    #[derive(Debug, Default)]
    pub struct NoopMeterProvider {
        _private: (),
    }

    impl NoopMeterProvider {
        /// Create a new no-op meter provider.
        pub fn new() -> Self {
            Self { _private: () }
        }
    }

    impl MeterProvider for NoopMeterProvider {
        fn meter_with_scope(&self, _scope: InstrumentationScope) -> Meter {
            Meter::new(Arc::new(NoopMeter::new()))
        }
    }

    #[derive(Debug, Default)]
    pub struct NoopMeter {
        _private: (),
    }

    impl NoopMeter {
        /// Create a new no-op meter core.
        pub fn new() -> Self {
            Self { _private: () }
        }
    }

    impl InstrumentProvider for NoopMeter {}
}

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, error};

use crate::config::Config;
use crate::detectors::{
    DeadLoopDetector, DetectionContext, Detector, FormatStringDetector, HeaderDetector, MemoryLeakDetector,
    NumericRangeDetector, PointerDetector, UninitializedDetector,
};
use crate::types::Issue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub enabled: bool,
}

/// Runs every enabled detector over one file's context.
pub struct DetectorManager {
    detectors: Vec<Arc<dyn Detector>>,
}

impl Default for DetectorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorManager {
    pub fn new() -> Self {
        Self::with_detectors(vec![
            Arc::new(UninitializedDetector),
            Arc::new(PointerDetector),
            Arc::new(DeadLoopDetector),
            Arc::new(MemoryLeakDetector),
            Arc::new(NumericRangeDetector),
            Arc::new(FormatStringDetector),
            Arc::new(HeaderDetector::new()),
        ])
    }

    pub fn with_detectors(detectors: Vec<Arc<dyn Detector>>) -> Self {
        DetectorManager { detectors }
    }

    pub fn add_detector<D: Detector + 'static>(mut self, detector: D) -> Self {
        self.detectors.push(Arc::new(detector));
        self
    }

    /// Names of the detectors `config` turns on, in registration order.
    pub fn detector_names(&self, config: &Config) -> Vec<&'static str> {
        self.detectors.iter().filter(|d| d.is_enabled(config)).map(|d| d.name()).collect()
    }

    pub fn list_detectors(&self, config: &Config) -> Vec<DetectorInfo> {
        self.detectors
            .iter()
            .map(|d| DetectorInfo { name: d.name(), description: d.description(), enabled: d.is_enabled(config) })
            .collect()
    }

    pub fn detect(&self, ctx: &DetectionContext) -> Vec<Issue> {
        let enabled: Vec<&dyn Detector> = self
            .detectors
            .iter()
            .map(|d| d.as_ref())
            .filter(|d| d.is_enabled(ctx.config))
            .collect();

        if ctx.config.parallel {
            enabled.par_iter().flat_map(|detector| run_isolated(*detector, ctx)).collect()
        } else {
            enabled.iter().flat_map(|detector| run_isolated(*detector, ctx)).collect()
        }
    }
}

/// A failing or panicking detector contributes nothing.
fn run_isolated(detector: &dyn Detector, ctx: &DetectionContext) -> Vec<Issue> {
    match panic::catch_unwind(AssertUnwindSafe(|| detector.detect(ctx))) {
        Ok(Ok(issues)) => {
            debug!(detector = detector.name(), file = ctx.file_path, count = issues.len(), "detector finished");
            issues
        }
        Ok(Err(e)) => {
            error!(detector = detector.name(), file = ctx.file_path, "detector failed: {}", e);
            Vec::new()
        }
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(detector = detector.name(), file = ctx.file_path, "detector panicked: {}", reason);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testing::Fixture;
    use crate::error::{Result, ScanError};
    use crate::types::Category;
    use pretty_assertions::assert_eq;

    struct Failing;

    impl Detector for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn description(&self) -> &'static str {
            "always errors"
        }
        fn is_enabled(&self, _: &Config) -> bool {
            true
        }
        fn detect(&self, _: &DetectionContext) -> Result<Vec<Issue>> {
            Err(ScanError::Detector { name: "failing", message: "boom".into() })
        }
    }

    struct Panicking;

    impl Detector for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }
        fn description(&self) -> &'static str {
            "always panics"
        }
        fn is_enabled(&self, _: &Config) -> bool {
            true
        }
        fn detect(&self, _: &DetectionContext) -> Result<Vec<Issue>> {
            panic!("detector bug")
        }
    }

    const SOURCE: &str = "int main() {\n    int x;\n    return x;\n}\n";

    #[test]
    fn names_follow_toggles() {
        let manager = DetectorManager::new();
        let mut config = Config::default();
        assert_eq!(manager.detector_names(&config).len(), 7);

        config.categories.wild_pointers = false;
        assert!(manager.detector_names(&config).contains(&"pointer"));
        config.categories.null_pointers = false;
        config.categories.library_headers = false;
        let names = manager.detector_names(&config);
        assert!(!names.contains(&"pointer"));
        assert!(!names.contains(&"header"));
    }

    #[test]
    fn failures_are_isolated() {
        for parallel in [false, true] {
            let mut fixture = Fixture::new(SOURCE);
            fixture.config.parallel = parallel;
            let manager = DetectorManager::with_detectors(vec![Arc::new(Failing), Arc::new(UninitializedDetector)])
                .add_detector(Panicking);
            let issues = manager.detect(&fixture.ctx());
            assert_eq!(issues.len(), 1);
            assert_eq!(issues[0].category, Category::Uninitialized);
        }
    }

    #[test]
    fn serial_and_parallel_agree() {
        let mut fixture = Fixture::new("int main() {\n    int x;\n    int *p;\n    *p = x;\n    for (;;) { }\n}\n");
        let manager = DetectorManager::new();
        let mut serial = manager.detect(&fixture.ctx());
        fixture.config.parallel = true;
        let mut parallel = manager.detect(&fixture.ctx());
        serial.sort_by_key(|i| (i.line, i.category));
        parallel.sort_by_key(|i| (i.line, i.category));
        assert_eq!(serial, parallel);
        assert!(!serial.is_empty());
    }
}

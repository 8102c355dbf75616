//! Run counters reported for each stage of a configs release.
//!
//! Failures cascade: a failed generation also reports failed upload and test
//! runs, since those stages will not run and would otherwise look like they
//! never happened.

use std::fmt;
use tracing::info;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Generation,
    Upload,
    Test,
}

impl Metric {
    pub fn metric_type(&self) -> &'static str {
        match self {
            Metric::Generation => "custom.googleapis.com/rbe/bazel-toolchains/generation/runs",
            Metric::Upload => "custom.googleapis.com/rbe/bazel-toolchains/upload/runs",
            Metric::Test => "custom.googleapis.com/rbe/bazel-toolchains/test/runs",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metric_type())
    }
}

/// Backend that records one increment of a counter.
pub trait MetricSink {
    fn record(&self, metric: Metric, docker_image: &str, success: bool) -> Result<()>;
}

/// Emits each report as a structured log event.
pub struct LogSink {
    project_id: String,
}

impl LogSink {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
        }
    }
}

impl MetricSink for LogSink {
    fn record(&self, metric: Metric, docker_image: &str, success: bool) -> Result<()> {
        info!(
            project_id = %self.project_id,
            metric = %metric,
            docker_image = %docker_image,
            success,
            "recorded toolchain configs run"
        );
        Ok(())
    }
}

pub struct Reporter<S: MetricSink> {
    sink: S,
}

impl<S: MetricSink> Reporter<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn report_generation(&self, docker_image: &str, success: bool) -> Result<()> {
        self.sink.record(Metric::Generation, docker_image, success)?;
        if !success {
            return self.report_upload(docker_image, false);
        }
        Ok(())
    }

    pub fn report_upload(&self, docker_image: &str, success: bool) -> Result<()> {
        self.sink.record(Metric::Upload, docker_image, success)?;
        if !success {
            return self.report_test(docker_image, false);
        }
        Ok(())
    }

    pub fn report_test(&self, docker_image: &str, success: bool) -> Result<()> {
        self.sink.record(Metric::Test, docker_image, success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingSink {
        records: RefCell<Vec<(Metric, String, bool)>>,
    }

    impl MetricSink for &RecordingSink {
        fn record(&self, metric: Metric, docker_image: &str, success: bool) -> Result<()> {
            self.records
                .borrow_mut()
                .push((metric, docker_image.to_string(), success));
            Ok(())
        }
    }

    #[test]
    fn generation_failure_cascades_to_upload_and_test() {
        let sink = RecordingSink::default();
        Reporter::new(&sink)
            .report_generation("rbe-ubuntu1604", false)
            .unwrap();
        assert_eq!(
            *sink.records.borrow(),
            vec![
                (Metric::Generation, "rbe-ubuntu1604".to_string(), false),
                (Metric::Upload, "rbe-ubuntu1604".to_string(), false),
                (Metric::Test, "rbe-ubuntu1604".to_string(), false),
            ]
        );
    }

    #[test]
    fn success_reports_only_its_own_stage() {
        let sink = RecordingSink::default();
        let reporter = Reporter::new(&sink);
        reporter.report_generation("rbe-ubuntu1604", true).unwrap();
        reporter.report_upload("rbe-ubuntu1604", true).unwrap();
        assert_eq!(sink.records.borrow().len(), 2);
    }

    #[test]
    fn upload_failure_cascades_to_test_only() {
        let sink = RecordingSink::default();
        Reporter::new(&sink)
            .report_upload("rbe-windows", false)
            .unwrap();
        let metrics: Vec<Metric> = sink.records.borrow().iter().map(|r| r.0).collect();
        assert_eq!(metrics, vec![Metric::Upload, Metric::Test]);
    }
}

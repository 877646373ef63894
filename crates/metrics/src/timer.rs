use std::{
    collections::BTreeSet,
    mem,
    time::{
        Duration,
        Instant,
    },
};

use prometheus::{
    Histogram,
    HistogramVec,
};

use crate::{
    get_desc,
    labels::StaticMetricLabel,
    log_distribution,
    log_distribution_with_labels,
};

/// Observes elapsed time into an unlabeled histogram when dropped.
pub struct Timer {
    start: Instant,
    histogram: &'static Histogram,
}

impl Timer {
    pub fn new(histogram: &'static Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed_duration = self.start.elapsed();
        let elapsed = elapsed_duration.as_secs_f64();
        let desc = get_desc(self.histogram);
        tracing::debug!("{elapsed_duration:?} for timer {desc:?}");
        log_distribution(self.histogram, elapsed);
    }
}

/// Status timer that defaults to error unless `.finish()` is explicitly called
/// upon success.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    labels: BTreeSet<StaticMetricLabel>,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        let mut labels = BTreeSet::new();
        labels.insert(StaticMetricLabel::STATUS_ERROR);
        Self {
            start: Instant::now(),
            histogram,
            labels,
        }
    }

    pub fn add_label(&mut self, label: StaticMetricLabel) {
        self.labels.insert(label);
    }

    fn replace_label(&mut self, old_label: StaticMetricLabel, new_label: StaticMetricLabel) {
        self.labels.remove(&old_label);
        self.labels.insert(new_label);
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finish the timer with status success.
    pub fn finish(mut self) -> Duration {
        self.replace_label(StaticMetricLabel::STATUS_ERROR, StaticMetricLabel::STATUS_SUCCESS);
        self.elapsed()
    }

    /// Finish the timer with developer error.
    pub fn finish_developer_error(mut self) -> Duration {
        self.replace_label(
            StaticMetricLabel::STATUS_ERROR,
            StaticMetricLabel::STATUS_DEVELOPER_ERROR,
        );
        self.elapsed()
    }

    /// Finish the timer with the given status.
    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.replace_label(StaticMetricLabel::STATUS_ERROR, StaticMetricLabel::new("status", status));
        self.elapsed()
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed_duration = self.start.elapsed();
        let elapsed = elapsed_duration.as_secs_f64();
        let desc = get_desc(self.histogram);
        tracing::debug!("{elapsed_duration:?} for timer {desc:?} {:?}", self.labels);
        let labels = mem::take(&mut self.labels);
        log_distribution_with_labels(self.histogram, elapsed, labels.into_iter().collect());
    }
}

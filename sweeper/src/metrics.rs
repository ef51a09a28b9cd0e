//! Run and git metrics, emitted through the `metrics` facade.
//!
//! Nothing is exported unless the embedding program installs a recorder
//! (for example a Prometheus exporter); without one every call is a no-op.

use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use crate::core::result::ProcessResult;

pub const RUN_START_TIME: &str = "sweeper_run_start_time_seconds";
pub const RUN_FINISH_TIME: &str = "sweeper_run_finish_time_seconds";
pub const RUN_TASK_SUCCESS: &str = "sweeper_run_task_success";
pub const PROCESS_RESULTS: &str = "sweeper_process_results_total";
pub const GIT_COMMAND_DURATION: &str = "sweeper_git_command_duration_seconds";

/// Register help texts with the installed recorder.
pub fn describe() {
    describe_gauge!(RUN_START_TIME, Unit::Seconds, "Unix time when the most recent run started.");
    describe_gauge!(RUN_FINISH_TIME, Unit::Seconds, "Unix time when the most recent run finished.");
    describe_gauge!(
        RUN_TASK_SUCCESS,
        "Status of the last pair processed for a task. 1 is success, 0 is failure."
    );
    describe_counter!(PROCESS_RESULTS, "Processed (repository, task) pairs by result.");
    describe_histogram!(
        GIT_COMMAND_DURATION,
        Unit::Seconds,
        "Duration of git commands by subcommand."
    );
}

pub fn record_run_start(at: DateTime<Utc>) {
    gauge!(RUN_START_TIME).set(unix_seconds(at));
}

pub fn record_run_finish(at: DateTime<Utc>) {
    gauge!(RUN_FINISH_TIME).set(unix_seconds(at));
}

/// Record the outcome of one pair. `Unknown` marks a failed pair.
pub fn record_task_result(task: &str, result: ProcessResult) {
    let success = if result == ProcessResult::Unknown { 0.0 } else { 1.0 };
    gauge!(RUN_TASK_SUCCESS, "task" => task.to_string()).set(success);
    counter!(PROCESS_RESULTS, "task" => task.to_string(), "result" => result.as_str()).increment(1);
}

pub fn record_git_command(subcommand: &str, elapsed: Duration) {
    histogram!(GIT_COMMAND_DURATION, "command" => subcommand.to_string())
        .record(elapsed.as_secs_f64());
}

fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MetricsRecorder;

    #[test]
    fn task_results_update_success_and_counts() {
        let recorder = MetricsRecorder::default();
        ::metrics::with_local_recorder(&recorder, || {
            record_task_result("demo", ProcessResult::PrCreated);
            record_task_result("demo", ProcessResult::PrOpen);
            record_task_result("demo", ProcessResult::Unknown);
        });

        assert_eq!(recorder.gauge("sweeper_run_task_success{task=demo}"), Some(0.0));
        assert_eq!(
            recorder.counter("sweeper_process_results_total{result=pr_created,task=demo}"),
            1
        );
        assert_eq!(
            recorder.counter("sweeper_process_results_total{result=unknown,task=demo}"),
            1
        );
    }

    #[test]
    fn run_times_are_unix_seconds() {
        let recorder = MetricsRecorder::default();
        let at = DateTime::<Utc>::from_timestamp(1_700_000_000, 500_000_000).expect("time");
        ::metrics::with_local_recorder(&recorder, || record_run_start(at));
        assert_eq!(recorder.gauge("sweeper_run_start_time_seconds"), Some(1_700_000_000.5));
    }

    #[test]
    fn git_durations_are_keyed_by_subcommand() {
        let recorder = MetricsRecorder::default();
        ::metrics::with_local_recorder(&recorder, || {
            record_git_command("clone", Duration::from_millis(1500));
            record_git_command("clone", Duration::from_millis(500));
        });
        assert_eq!(
            recorder.histogram("sweeper_git_command_duration_seconds{command=clone}"),
            vec![1.5, 0.5]
        );
    }
}

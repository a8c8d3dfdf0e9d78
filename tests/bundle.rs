mod common;

use std::fs;
use std::path::Path;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::{NaiveDate, NaiveDateTime};

use det_trial_cli::archive::read_archive;
use det_trial_cli::bundle::{
    BUNDLE_ENTRIES, BundleAssembler, BundleRequest, EXPERIMENT_CALL_ENTRY, FixedClock,
    MASTER_LOGS_ENTRY, TRIAL_CALL_ENTRY, TRIAL_LOGS_ENTRY, bundle_file_name,
};
use det_trial_cli::domain::TrialId;
use det_trial_cli::error::DetError;
use det_trial_cli::output::JsonOutput;

use common::{FailAt, FakeMaster, master_line, session};

fn new_year() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn trial(id: u64) -> TrialId {
    TrialId::new(id).unwrap()
}

fn utf8(path: &Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
}

fn dir_len(path: &Path) -> usize {
    fs::read_dir(path).unwrap().count()
}

fn entry<'a>(items: &'a [(String, Vec<u8>)], name: &str) -> &'a [u8] {
    &items
        .iter()
        .find(|(entry, _)| entry == name)
        .unwrap_or_else(|| panic!("missing entry {name}"))
        .1
}

#[test]
fn bundle_holds_exactly_the_four_entries() {
    let out = tempfile::tempdir().unwrap();
    let master = FakeMaster::default();
    let session = session();
    let request = BundleRequest {
        trial_id: trial(5),
        output_directory: Some(utf8(out.path())),
    };

    let result = BundleAssembler::with_clock(&master, &session, FixedClock(new_year()))
        .assemble(&request, &JsonOutput)
        .unwrap();

    assert_eq!(dir_len(out.path()), 1);
    let names: Vec<String> = read_archive(&result.path)
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, BUNDLE_ENTRIES);
}

#[test]
fn experiment_entry_matches_trial_experiment_id() {
    let out = tempfile::tempdir().unwrap();
    let master = FakeMaster {
        experiment_id: 17,
        ..FakeMaster::default()
    };
    let session = session();
    let request = BundleRequest {
        trial_id: trial(5),
        output_directory: Some(utf8(out.path())),
    };

    let result = BundleAssembler::with_clock(&master, &session, FixedClock(new_year()))
        .assemble(&request, &JsonOutput)
        .unwrap();
    let items = read_archive(&result.path).unwrap();

    let trial_json: serde_json::Value =
        serde_json::from_slice(entry(&items, TRIAL_CALL_ENTRY)).unwrap();
    let experiment_json: serde_json::Value =
        serde_json::from_slice(entry(&items, EXPERIMENT_CALL_ENTRY)).unwrap();
    assert_eq!(trial_json["experimentId"], 17);
    assert_eq!(experiment_json["experiment"]["id"], trial_json["experimentId"]);
    assert_eq!(result.experiment_id, 17);
    assert_eq!(*master.experiment_calls.lock().unwrap(), vec![17]);
}

#[test]
fn empty_trial_log_still_produces_the_entry() {
    let out = tempfile::tempdir().unwrap();
    let master = FakeMaster {
        trial_logs: Vec::new(),
        ..FakeMaster::default()
    };
    let session = session();
    let request = BundleRequest {
        trial_id: trial(5),
        output_directory: Some(utf8(out.path())),
    };

    let result = BundleAssembler::with_clock(&master, &session, FixedClock(new_year()))
        .assemble(&request, &JsonOutput)
        .unwrap();
    let items = read_archive(&result.path).unwrap();

    assert!(entry(&items, TRIAL_LOGS_ENTRY).is_empty());
    assert_eq!(result.trial_log_lines, 0);
}

#[test]
fn any_fetch_failure_leaves_no_archive_and_keeps_the_cause() {
    for fail_at in [
        FailAt::TrialLogs,
        FailAt::TrialLogsMidStream,
        FailAt::MasterLogs,
        FailAt::Trial,
        FailAt::Experiment,
    ] {
        let out = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let master = FakeMaster::failing_at(fail_at);
        let session = session();
        let request = BundleRequest {
            trial_id: trial(9),
            output_directory: Some(utf8(out.path())),
        };

        let err = BundleAssembler::with_clock(&master, &session, FixedClock(new_year()))
            .staging_root(staging.path())
            .assemble(&request, &JsonOutput)
            .unwrap_err();

        match fail_at {
            FailAt::TrialLogs | FailAt::Trial => {
                assert_matches!(err, DetError::MasterStatus { status: 404, ref message } if message == "trial 9 not found")
            }
            FailAt::Experiment => {
                assert_matches!(err, DetError::MasterStatus { status: 404, ref message } if message == "experiment 3 not found")
            }
            FailAt::TrialLogsMidStream => assert_matches!(err, DetError::MasterStream(_)),
            FailAt::MasterLogs => assert_matches!(err, DetError::MasterHttp(_)),
        }
        assert_eq!(dir_len(out.path()), 0, "archive left behind after {fail_at:?}");
        assert_eq!(dir_len(staging.path()), 0, "staging left behind after {fail_at:?}");
    }
}

#[test]
fn staging_directory_is_removed_after_success() {
    let out = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let master = FakeMaster::default();
    let session = session();
    let request = BundleRequest {
        trial_id: trial(5),
        output_directory: Some(utf8(out.path())),
    };

    BundleAssembler::with_clock(&master, &session, FixedClock(new_year()))
        .staging_root(staging.path())
        .assemble(&request, &JsonOutput)
        .unwrap();

    assert_eq!(dir_len(staging.path()), 0);
}

#[test]
fn fixed_clock_gives_exact_name() {
    let out = tempfile::tempdir().unwrap();
    let master = FakeMaster::default();
    let session = session();
    let request = BundleRequest {
        trial_id: trial(42),
        output_directory: Some(utf8(out.path())),
    };

    let result = BundleAssembler::with_clock(&master, &session, FixedClock(new_year()))
        .assemble(&request, &JsonOutput)
        .unwrap();

    assert_eq!(
        result.path.file_name(),
        Some("det-bundle-trial-42-20240101T000000.tar.gz")
    );
    assert_eq!(result.path.parent(), Some(utf8(out.path()).as_path()));
    assert!(result.path.as_std_path().is_file());
}

#[test]
fn same_second_different_trials_get_distinct_archives() {
    let out = tempfile::tempdir().unwrap();
    let master = FakeMaster::default();
    let session = session();
    let assembler = BundleAssembler::with_clock(&master, &session, FixedClock(new_year()));

    let first = assembler
        .assemble(
            &BundleRequest {
                trial_id: trial(1),
                output_directory: Some(utf8(out.path())),
            },
            &JsonOutput,
        )
        .unwrap();
    let second = assembler
        .assemble(
            &BundleRequest {
                trial_id: trial(2),
                output_directory: Some(utf8(out.path())),
            },
            &JsonOutput,
        )
        .unwrap();

    assert_ne!(first.path, second.path);
    assert_eq!(dir_len(out.path()), 2);
}

#[test]
fn same_second_same_trial_overwrites() {
    let out = tempfile::tempdir().unwrap();
    let session = session();
    let request = BundleRequest {
        trial_id: trial(4),
        output_directory: Some(utf8(out.path())),
    };

    let first_master = FakeMaster {
        trial_logs: vec!["old".to_string()],
        ..FakeMaster::default()
    };
    BundleAssembler::with_clock(&first_master, &session, FixedClock(new_year()))
        .assemble(&request, &JsonOutput)
        .unwrap();

    let second_master = FakeMaster {
        trial_logs: vec!["new".to_string()],
        ..FakeMaster::default()
    };
    let result = BundleAssembler::with_clock(&second_master, &session, FixedClock(new_year()))
        .assemble(&request, &JsonOutput)
        .unwrap();

    assert_eq!(dir_len(out.path()), 1);
    let items = read_archive(&result.path).unwrap();
    assert_eq!(entry(&items, TRIAL_LOGS_ENTRY), b"new");
}

#[test]
fn log_entries_are_rendered_as_expected() {
    let out = tempfile::tempdir().unwrap();
    let master = FakeMaster {
        trial_logs: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        master_logs: vec![master_line("t0", "INFO", "m")],
        ..FakeMaster::default()
    };
    let session = session();
    let request = BundleRequest {
        trial_id: trial(7),
        output_directory: Some(utf8(out.path())),
    };

    let result = BundleAssembler::with_clock(&master, &session, FixedClock(new_year()))
        .assemble(&request, &JsonOutput)
        .unwrap();
    let items = read_archive(&result.path).unwrap();

    assert_eq!(entry(&items, TRIAL_LOGS_ENTRY), b"abc");
    assert_eq!(entry(&items, MASTER_LOGS_ENTRY), b"t0 [INFO]: m");
    assert_eq!(result.trial_log_lines, 3);
    assert_eq!(result.master_log_lines, 1);
}

#[test]
fn master_log_lines_are_newline_separated() {
    let out = tempfile::tempdir().unwrap();
    let master = FakeMaster {
        master_logs: vec![
            master_line("t0", "LOG_LEVEL_INFO", "starting"),
            master_line("t1", "LOG_LEVEL_WARNING", "slow agent"),
        ],
        ..FakeMaster::default()
    };
    let session = session();
    let request = BundleRequest {
        trial_id: trial(7),
        output_directory: Some(utf8(out.path())),
    };

    let result = BundleAssembler::with_clock(&master, &session, FixedClock(new_year()))
        .assemble(&request, &JsonOutput)
        .unwrap();
    let items = read_archive(&result.path).unwrap();

    assert_eq!(
        entry(&items, MASTER_LOGS_ENTRY),
        b"t0 [INFO]: starting\nt1 [WARNING]: slow agent"
    );
}

#[test]
fn missing_output_directory_is_a_filesystem_error() {
    let out = tempfile::tempdir().unwrap();
    let master = FakeMaster::default();
    let session = session();
    let request = BundleRequest {
        trial_id: trial(5),
        output_directory: Some(utf8(&out.path().join("missing"))),
    };

    let err = BundleAssembler::with_clock(&master, &session, FixedClock(new_year()))
        .assemble(&request, &JsonOutput)
        .unwrap_err();

    assert_matches!(err, DetError::Filesystem(_));
}

#[test]
fn file_name_differs_only_by_trial_for_equal_times() {
    assert_ne!(
        bundle_file_name(trial(1), new_year()),
        bundle_file_name(trial(11), new_year())
    );
}

//! End-to-end merge runs over on-disk fragments.

mod common;

use casemerge::fragment::read_bundle;
use casemerge::mapping::{AttributeLookup, MappingConfig};
use casemerge::merge::{MergeProcessor, RejectionReason};
use casemerge::model::{AttributeType, AttributeValue, Priority, Section, Status};
use casemerge::section::derive_id;
use casemerge::{CancellationToken, Error, MergeConfig, run_merge};
use common::{RunDir, case, fragment, root_sections, schema, with_attr};
use pretty_assertions::assert_eq;

#[test]
fn same_attribute_from_two_fragments_merges_into_one_entry() {
    let run = RunDir::new();
    let mut first = fragment(1);
    first.sections = root_sections();
    first.attributes = vec![schema("Priority", AttributeType::Options, &["P1", "P2"])];
    let mut second = fragment(2);
    second.attributes = vec![schema("Priority", AttributeType::Options, &["P2", "P3"])];
    run.write(&first);
    run.write(&second);

    let outcome = run_merge(&run.config(), &CancellationToken::new()).expect("merge");
    let priority = outcome
        .bundle
        .attributes
        .iter()
        .filter(|attr| attr.name == "Priority")
        .collect::<Vec<_>>();
    assert_eq!(priority.len(), 1);
    assert_eq!(priority[0].options, ["P1", "P2", "P3"]);
    assert_eq!(priority[0].id, derive_id("attribute", "Priority").to_string());
}

#[test]
fn same_attribute_with_two_types_is_a_merge_conflict() {
    let run = RunDir::new();
    let mut first = fragment(1);
    first.sections = root_sections();
    first.attributes = vec![schema("Priority", AttributeType::Options, &["P1"])];
    let mut second = fragment(2);
    second.attributes = vec![schema("Priority", AttributeType::String, &[])];
    run.write(&first);
    run.write(&second);

    let err = run_merge(&run.config(), &CancellationToken::new()).expect_err("conflict");
    match err {
        Error::MergeConflict {
            name,
            first,
            second,
        } => {
            assert_eq!(name, "Priority");
            assert_eq!(first, AttributeType::Options);
            assert_eq!(second, AttributeType::String);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!run.output_path().exists(), "no bundle on fatal error");
}

#[test]
fn unknown_section_rejects_only_that_test_case() {
    let run = RunDir::new();
    let mut first = fragment(1);
    first.sections = root_sections();
    first.test_cases = vec![case("TC-1", 2), case("TC-2", 42), case("TC-3", 3)];
    run.write(&first);

    let outcome = run_merge(&run.config(), &CancellationToken::new()).expect("merge");
    let ids = outcome
        .bundle
        .test_cases
        .iter()
        .map(|tc| tc.external_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, ["TC-1", "TC-3"]);

    assert_eq!(outcome.report.rejected_count, 1);
    let rejection = &outcome.report.rejections[0];
    assert_eq!(rejection.external_id, "TC-2");
    assert_eq!(
        rejection.reason,
        RejectionReason::UnknownSection { section_id: 42 }
    );
}

#[test]
fn repeated_tags_collapse() {
    let run = RunDir::new();
    let mut first = fragment(1);
    first.sections = root_sections();
    let mut tc = case("TC-1", 1);
    tc.tags = ["a", "a", "b"].map(str::to_string).to_vec();
    first.test_cases = vec![tc];
    run.write(&first);

    let outcome = run_merge(&run.config(), &CancellationToken::new()).expect("merge");
    assert_eq!(outcome.bundle.test_cases[0].tags, ["a", "b"]);
}

#[test]
fn missing_required_attribute_is_rejected_by_name() {
    let run = RunDir::new();
    let mut first = fragment(1);
    first.sections = root_sections();
    first.test_cases = vec![
        case("TC-without", 2),
        with_attr(case("TC-with", 2), "Component", "Auth"),
    ];
    run.write(&first);

    let mut config = run.config();
    config.required_model.required_attribute_names = vec!["Component".to_string()];
    let outcome = run_merge(&config, &CancellationToken::new()).expect("merge");

    assert_eq!(outcome.report.accepted_count, 1);
    assert_eq!(outcome.bundle.test_cases[0].external_id, "TC-with");
    let rejection = &outcome.report.rejections[0];
    assert_eq!(rejection.external_id, "TC-without");
    assert_eq!(
        rejection.reason,
        RejectionReason::MissingAttribute {
            attribute: "Component".to_string()
        }
    );
    assert!(rejection.reason.is_validation());
}

#[test]
fn corrupt_fragment_is_skipped_and_reported() {
    let run = RunDir::new();
    let mut first = fragment(1);
    first.sections = root_sections();
    first.test_cases = vec![case("TC-1", 2)];
    run.write(&first);
    let broken = run.write_raw("fragment-000002.json", "{\"sequenceNumber\": 2, \"testCa");
    let mut third = fragment(3);
    third.test_cases = vec![case("TC-3", 3)];
    run.write(&third);

    let outcome = run_merge(&run.config(), &CancellationToken::new()).expect("merge");
    assert_eq!(outcome.report.accepted_count, 2);
    assert_eq!(outcome.report.skipped_fragments.len(), 1);
    assert_eq!(outcome.report.skipped_fragments[0].path, broken);
    assert!(
        outcome.report.skipped_fragments[0]
            .reason
            .contains("fragment-000002.json")
    );
}

#[test]
fn bundle_bytes_do_not_depend_on_worker_count() {
    let run = RunDir::new();
    let mut sections = root_sections();
    sections.extend((10..20).map(|id| Section::new(id, format!("S{id}"), Some(1))));
    for seq in 1..=12_u64 {
        let mut frag = fragment(seq);
        if seq == 1 {
            frag.sections = sections.clone();
        }
        frag.attributes = vec![schema(
            "Component",
            AttributeType::Options,
            &[format!("C{}", seq % 4).as_str()],
        )];
        frag.test_cases = (0..8)
            .map(|n| {
                let section = 10 + i64::try_from((seq + n) % 10).expect("small");
                let mut tc =
                    with_attr(case(&format!("TC-{seq:02}-{n}"), section), "Component", "x");
                tc.tags = vec![format!("t{}", n % 3), "shared".to_string()];
                tc
            })
            .collect();
        run.write(&frag);
    }

    let mut digests = Vec::new();
    for workers in [1, 3, 8] {
        let mut config = run.config();
        config.workers = workers;
        let outcome = run_merge(&config, &CancellationToken::new()).expect("merge");
        let bytes = std::fs::read(run.output_path()).expect("read bundle");
        digests.push((bytes, outcome.report.bundle_sha256.expect("digest")));
    }
    assert!(digests.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn written_bundle_round_trips_and_references_are_intact() {
    let run = RunDir::new();
    let mut first = fragment(1);
    first.sections = root_sections();
    let mut tc = case("TC-1", 3);
    tc.priority = Some("blocker".to_string());
    tc.status = Some("needs_work".to_string());
    first.test_cases = vec![tc];
    run.write(&first);

    let outcome = run_merge(&run.config(), &CancellationToken::new()).expect("merge");
    let reread = read_bundle(&run.output_path()).expect("read bundle");
    assert_eq!(reread, outcome.bundle);

    let tc = &reread.test_cases[0];
    assert_eq!(tc.priority, Priority::Critical);
    assert_eq!(tc.state, Status::NeedsWork);
    assert_eq!(tc.section_id, derive_id("section", "3"));
    assert_eq!(tc.id, derive_id("test-case", "TC-1"));
    assert_eq!(reread.sections.len(), 3);
}

#[test]
fn duplicate_external_id_keeps_first_fragment() {
    let run = RunDir::new();
    let mut first = fragment(1);
    first.sections = root_sections();
    first.test_cases = vec![case("TC-1", 2)];
    let mut second = fragment(2);
    second.test_cases = vec![case("TC-1", 3)];
    run.write(&first);
    run.write(&second);

    let outcome = run_merge(&run.config(), &CancellationToken::new()).expect("merge");
    assert_eq!(outcome.bundle.test_cases.len(), 1);
    assert_eq!(
        outcome.bundle.test_cases[0].section_id,
        derive_id("section", "2")
    );
    assert_eq!(
        outcome.report.rejections[0].reason,
        RejectionReason::DuplicateTestCase { first_sequence: 1 }
    );
}

#[test]
fn sections_repeated_across_fragments_are_collapsed() {
    let run = RunDir::new();
    let mut first = fragment(1);
    first.sections = root_sections();
    let mut second = fragment(2);
    second.sections = root_sections();
    run.write(&first);
    run.write(&second);

    let outcome = run_merge(&run.config(), &CancellationToken::new()).expect("merge");
    assert_eq!(outcome.bundle.sections.len(), 3);
}

#[test]
fn conflicting_section_definitions_abort() {
    let run = RunDir::new();
    let mut first = fragment(1);
    first.sections = root_sections();
    let mut second = fragment(2);
    second.sections = vec![Section::new(2, "Authentication", Some(1))];
    run.write(&first);
    run.write(&second);

    let err = run_merge(&run.config(), &CancellationToken::new()).expect_err("duplicate");
    assert!(matches!(err, Error::DuplicateSection { id: 2 }), "{err}");
}

#[test]
fn orphan_section_rejects_the_run() {
    let run = RunDir::new();
    let mut first = fragment(1);
    first.sections = vec![Section::new(5, "Stray", Some(77))];
    run.write(&first);

    let err = run_merge(&run.config(), &CancellationToken::new()).expect_err("orphan");
    assert!(matches!(err, Error::OrphanSection { id: 5, parent_id: 77 }), "{err}");
}

#[test]
fn attribute_values_and_options_are_mapped() {
    let run = RunDir::new();
    let mapping_dir = run.root().join("mappings");
    std::fs::create_dir_all(&mapping_dir).expect("mkdir");
    std::fs::write(
        mapping_dir.join("Component.json"),
        r#"{"auth-svc": "Authentication", "pay": "Billing"}"#,
    )
    .expect("write mapping");
    let mapping_config = run.root().join("mapping.json");
    std::fs::write(&mapping_config, "{}").expect("write mapping config");

    let mut first = fragment(1);
    first.sections = root_sections();
    first.attributes = vec![schema(
        "Component",
        AttributeType::Options,
        &["auth-svc", "pay", "Billing"],
    )];
    first.test_cases = vec![with_attr(case("TC-1", 2), "Component", "auth-svc")];
    run.write(&first);

    let mut config = run.config();
    config.mapping = Some(casemerge::config::MappingSettings {
        config_path: mapping_config,
        mapping_dir,
    });
    let outcome = run_merge(&config, &CancellationToken::new()).expect("merge");

    assert_eq!(
        outcome.bundle.test_cases[0].attributes["Component"],
        AttributeValue::from("Authentication")
    );
    assert_eq!(
        outcome.bundle.attributes[0].options,
        ["Authentication", "Billing"]
    );
}

#[test]
fn malformed_mapping_aborts_before_fragments_are_read() {
    let run = RunDir::new();
    let mapping_dir = run.root().join("mappings");
    std::fs::create_dir_all(&mapping_dir).expect("mkdir");
    std::fs::write(mapping_dir.join("Owner.json"), "[1, 2").expect("write mapping");
    let mapping_config = run.root().join("mapping.json");
    std::fs::write(&mapping_config, "{}").expect("write mapping config");

    let mut config = run.config();
    config.fragments_dir = run.root().join("never-created");
    config.mapping = Some(casemerge::config::MappingSettings {
        config_path: mapping_config,
        mapping_dir,
    });
    let err = run_merge(&config, &CancellationToken::new()).expect_err("malformed");
    assert!(matches!(err, Error::MappingFile { .. }), "{err}");
}

#[test]
fn cancelled_run_writes_nothing() {
    let run = RunDir::new();
    let mut first = fragment(1);
    first.sections = root_sections();
    first.test_cases = vec![case("TC-1", 2)];
    run.write(&first);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = run_merge(&run.config(), &cancel).expect_err("cancelled");
    assert!(matches!(err, Error::Cancelled));
    assert!(!run.output_path().exists());
}

#[test]
fn report_is_written_when_configured() {
    let run = RunDir::new();
    let mut first = fragment(1);
    first.sections = root_sections();
    first.test_cases = vec![case("TC-1", 2), case("TC-2", 99)];
    run.write(&first);

    let mut config = run.config();
    config.report_path = Some(run.root().join("out").join("report.json"));
    let outcome = run_merge(&config, &CancellationToken::new()).expect("merge");

    let text = std::fs::read_to_string(run.root().join("out").join("report.json"))
        .expect("read report");
    let report: casemerge::MergeReport = serde_json::from_str(&text).expect("parse report");
    assert_eq!(report, outcome.report);
    assert_eq!(report.accepted_count, 1);
    assert_eq!(report.rejected_count, 1);
    assert!(text.contains("\"kind\": \"unknown_section\""));
}

#[test]
fn assemble_without_writing() {
    let run = RunDir::new();
    let mut first = fragment(1);
    first.sections = root_sections();
    first.test_cases = vec![case("TC-1", 2)];
    run.write(&first);

    let config: MergeConfig = run.config();
    let mappings = MappingConfig::new();
    let outcome = MergeProcessor::new(&config, &mappings)
        .assemble(&CancellationToken::new())
        .expect("assemble");
    assert_eq!(outcome.bundle.test_cases.len(), 1);
    assert!(outcome.report.bundle_sha256.is_none());
    assert!(!run.output_path().exists());
}

#[test]
fn malformed_attribute_values_affect_only_their_test_case() {
    let run = RunDir::new();
    let mut head = fragment(1);
    head.sections = root_sections();
    run.write(&head);
    run.write_raw(
        "fragment-000002.json",
        r#"{
            "sequenceNumber": 2,
            "testCases": [
                {"externalId": "TC-1", "name": "Valid", "sectionId": 2,
                 "attributes": {"Component": "Auth"}},
                {"externalId": "TC-2", "name": "Null component", "sectionId": 2,
                 "attributes": {"Component": null}},
                {"externalId": "TC-3", "name": "Odd shapes", "sectionId": 3,
                 "priority": 2, "tags": null,
                 "attributes": {"Component": "Billing", "Build": 7}}
            ]
        }"#,
    );

    let mut config = run.config();
    config.required_model.required_attribute_names = vec!["Component".to_string()];
    let outcome = run_merge(&config, &CancellationToken::new()).expect("merge");

    assert!(outcome.report.skipped_fragments.is_empty());
    let accepted = outcome
        .bundle
        .test_cases
        .iter()
        .map(|tc| tc.external_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(accepted, ["TC-1", "TC-3"]);
    assert_eq!(outcome.report.rejections.len(), 1);
    assert_eq!(outcome.report.rejections[0].external_id, "TC-2");
    assert_eq!(
        outcome.report.rejections[0].reason,
        RejectionReason::MissingAttribute {
            attribute: "Component".to_string()
        }
    );

    let odd = &outcome.bundle.test_cases[1];
    assert_eq!(odd.priority, Priority::High);
    assert!(odd.tags.is_empty());
    assert_eq!(odd.attributes["Build"], AttributeValue::from("7"));
}

#[test]
fn sections_under_a_skipped_fragment_are_pruned() {
    let run = RunDir::new();
    run.write_raw(
        "fragment-000001.json",
        "{\"sequenceNumber\": 1, \"sections\": [{\"id\": 1,",
    );
    let mut second = fragment(2);
    second.sections = vec![
        Section::new(2, "Auth", Some(1)),
        Section::new(5, "Login", Some(2)),
        Section::new(9, "Reports", None),
    ];
    second.test_cases = vec![case("TC-2", 2), case("TC-5", 5), case("TC-9", 9)];
    run.write(&second);

    let outcome = run_merge(&run.config(), &CancellationToken::new()).expect("merge continues");
    assert_eq!(outcome.report.skipped_fragments.len(), 1);
    assert_eq!(outcome.report.pruned_sections, [2, 5]);
    assert_eq!(outcome.bundle.sections.len(), 1);
    assert_eq!(outcome.bundle.sections[0].name, "Reports");
    assert_eq!(outcome.bundle.test_cases.len(), 1);
    assert_eq!(outcome.bundle.test_cases[0].external_id, "TC-9");

    let rejected = outcome
        .report
        .rejections
        .iter()
        .map(|r| (r.external_id.as_str(), r.reason.clone()))
        .collect::<Vec<_>>();
    assert_eq!(
        rejected,
        [
            ("TC-2", RejectionReason::UnknownSection { section_id: 2 }),
            ("TC-5", RejectionReason::UnknownSection { section_id: 5 }),
        ]
    );
    assert!(run.output_path().exists());
}

#[test]
fn fragment_name_with_unusable_sequence_number_is_reported() {
    let run = RunDir::new();
    let mut first = fragment(1);
    first.sections = root_sections();
    first.test_cases = vec![case("TC-1", 2)];
    run.write(&first);
    let huge = run.write_raw("fragment-18446744073709551616.json", "{}");

    let outcome = run_merge(&run.config(), &CancellationToken::new()).expect("merge");
    assert_eq!(outcome.report.accepted_count, 1);
    assert_eq!(outcome.report.skipped_fragments.len(), 1);
    assert_eq!(outcome.report.skipped_fragments[0].path, huge);
    assert!(
        outcome.report.skipped_fragments[0]
            .reason
            .contains("unusable"),
        "{}",
        outcome.report.skipped_fragments[0].reason
    );
}

/// Trips the run's token the first time any attribute value is looked up.
struct CancelOnLookup {
    cancel: CancellationToken,
}

impl AttributeLookup for CancelOnLookup {
    fn lookup(&self, _attribute: &str, _source_value: &str) -> Option<&str> {
        self.cancel.cancel();
        None
    }
}

#[test]
fn cancelling_between_fragment_tasks_writes_nothing() {
    let run = RunDir::new();
    for seq in 1..=4_u64 {
        let mut frag = fragment(seq);
        if seq == 1 {
            frag.sections = root_sections();
        }
        frag.test_cases = vec![with_attr(
            case(&format!("TC-{seq}"), 2),
            "Component",
            "Auth",
        )];
        run.write(&frag);
    }

    let mut config = run.config();
    config.workers = 1;
    let cancel = CancellationToken::new();
    let lookup = CancelOnLookup {
        cancel: cancel.clone(),
    };
    let err = MergeProcessor::new(&config, &lookup)
        .run(&cancel)
        .expect_err("cancelled mid-run");
    assert!(matches!(err, Error::Cancelled), "{err}");
    assert!(cancel.is_cancelled());
    assert!(!run.output_path().exists());
}

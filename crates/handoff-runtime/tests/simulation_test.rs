//! End-to-end replay tests: JSONL scripts driven through a real coordinator
//! with the CRM tag-swap transfer.

use std::io::Write;
use std::sync::Arc;

use handoff_coordination::clock::ManualClock;
use handoff_coordination::{
    AgentType, CoordinationConfig, DecisionOutcome, ExecutionOutcome, HandoffCoordinator,
    Transition,
};
use handoff_runtime::{
    parse_script, CrmTagTransfer, MemoryContactStore, ScriptError, Simulation, StepReport,
};

fn simulation() -> (Simulation, Arc<MemoryContactStore>) {
    let clock = Arc::new(ManualClock::starting_now());
    let coordinator = HandoffCoordinator::builder(CoordinationConfig::default())
        .clock(clock.clone())
        .build()
        .expect("default config is valid");
    let contacts = Arc::new(MemoryContactStore::new().with_contact("c-1", ["Needs Qualifying"]));
    let transfer = Arc::new(CrmTagTransfer::new(contacts.clone()));
    (Simulation::new(coordinator, clock, transfer), contacts)
}

const BUYER_SCRIPT: &str = r#"
# lead qualifies a buyer
{"type":"message","conversation":"c-1","content":"I want to buy a 3BR house in Rancho Cucamonga"}
{"type":"advance","secs":30}
{"type":"message","conversation":"c-1","content":"I'm pre-approved and my budget is $680k"}
{"type":"evaluate","conversation":"c-1"}
{"type":"evaluate","conversation":"c-1"}
"#;

/// Test: an approved handoff is executed and ownership moves to the target
#[tokio::test]
async fn test_buyer_script_swaps_tags_and_owner() {
    let (mut simulation, contacts) = simulation();
    let reports = simulation
        .run(parse_script(BUYER_SCRIPT).unwrap())
        .await
        .unwrap();

    assert_eq!(reports.len(), 2);
    match &reports[0] {
        StepReport::Evaluated {
            source,
            target,
            decision,
            execution,
            ..
        } => {
            assert_eq!(*source, AgentType::Lead);
            assert_eq!(*target, Some(AgentType::Buyer));
            assert_eq!(decision.as_ref().unwrap().outcome, DecisionOutcome::Approved);
            assert_eq!(*execution, Some(ExecutionOutcome::Completed));
        }
        other => panic!("unexpected report {other:?}"),
    }

    // Second evaluation runs for the new owner; nothing favors another agent
    match &reports[1] {
        StepReport::Evaluated {
            source, decision, ..
        } => {
            assert_eq!(*source, AgentType::Buyer);
            assert!(decision.is_none());
        }
        other => panic!("unexpected report {other:?}"),
    }

    assert_eq!(simulation.owner("c-1"), AgentType::Buyer);
    assert_eq!(
        contacts.tags("c-1"),
        vec!["Buyer-Lead", "Handoff-Lead-to-Buyer"]
    );

    let summary = simulation.summary(5);
    assert_eq!(summary.owners.get("c-1"), Some(&AgentType::Buyer));
    assert_eq!(summary.analytics.approved, 1);
    assert_eq!(summary.analytics.executions_completed, 1);
}

/// Test: outcomes recorded by a script feed recalibration
#[tokio::test]
async fn test_outcomes_then_recalibrate() {
    let mut script = String::new();
    for confidence in [0.75, 0.77, 0.8, 0.82, 0.85, 0.9, 0.92, 0.95] {
        script.push_str(&format!(
            "{{\"type\":\"outcome\",\"source\":\"lead\",\"target\":\"seller\",\"confidence\":{confidence},\"result\":\"converted\"}}\n"
        ));
    }
    for _ in 0..2 {
        script.push_str(
            "{\"type\":\"outcome\",\"source\":\"lead\",\"target\":\"seller\",\"confidence\":0.72,\"result\":\"lost\"}\n",
        );
    }
    script.push_str("{\"type\":\"recalibrate\"}\n");

    let (mut simulation, _) = simulation();
    let reports = simulation.run(parse_script(&script).unwrap()).await.unwrap();

    let [StepReport::Recalibrated { step, report }] = reports.as_slice() else {
        panic!("expected one recalibration report, got {reports:?}");
    };
    assert_eq!(*step, 11);
    assert_eq!(report.adjusted.len(), 1);
    assert_eq!(
        report.adjusted[0].transition,
        Transition::new(AgentType::Lead, AgentType::Seller)
    );
    assert!(simulation
        .coordinator()
        .threshold(Transition::new(AgentType::Lead, AgentType::Seller))
        > 0.7);
}

/// Test: an invalid step aborts the replay and names the step
#[tokio::test]
async fn test_invalid_outcome_names_step() {
    let script = r#"
{"type":"sample","agent":"buyer","latency_ms":400}
{"type":"outcome","source":"lead","target":"buyer","confidence":1.5,"result":"lost"}
"#;
    let (mut simulation, _) = simulation();
    let err = simulation
        .run(parse_script(script).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ScriptError::Step { step: 2, .. }));
}

/// Test: scripts load from disk the way the CLI reads them
#[tokio::test]
async fn test_script_file_roundtrip() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(BUYER_SCRIPT.as_bytes()).unwrap();

    let raw = std::fs::read_to_string(file.path()).unwrap();
    let steps = parse_script(&raw).unwrap();
    assert_eq!(steps.len(), 5);

    let (mut simulation, _) = simulation();
    simulation.run(steps).await.unwrap();
    assert_eq!(simulation.owner("c-1"), AgentType::Buyer);
}

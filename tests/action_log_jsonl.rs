use evidence_harness::action_log::{
    hash_input, ActionOutcome, ActionRecord, ActionSink, JsonlActionSink,
};
use evidence_harness::agents::AgentAction;
use tempfile::tempdir;
use uuid::Uuid;

#[derive(Debug, serde::Deserialize)]
struct ActionRow {
    request_id: Uuid,
    action: String,
    model: String,
    input_hash: String,
    outcome: serde_json::Value,
}

fn make_record(request_id: Uuid, action: AgentAction, outcome: ActionOutcome) -> ActionRecord {
    ActionRecord {
        request_id,
        timestamp_ms: 0,
        action,
        model: "google/gemini-2.0-flash-001".to_string(),
        elapsed_ms: 12,
        input_tokens: 100,
        output_tokens: 20,
        cost_nanodollars: 1_000,
        input_hash: hash_input("<query>\nHow do I prime the pump?\n</query>"),
        outcome,
    }
}

#[test]
fn jsonl_action_sink_writes_records_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("actions.jsonl");
    let request_id = Uuid::new_v4();

    let (sink, worker) = JsonlActionSink::new(&path).unwrap();
    sink.record(make_record(request_id, AgentAction::RewriteQuery, ActionOutcome::Ok))
        .unwrap();
    sink.record(make_record(
        request_id,
        AgentAction::ExtractKnowledge,
        ActionOutcome::Error {
            code: "schema".to_string(),
        },
    ))
    .unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<ActionRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.request_id == request_id));
    assert!(rows.iter().all(|r| r.model == "google/gemini-2.0-flash-001"));
    assert_eq!(rows[0].action, "rewrite_query");
    assert_eq!(rows[0].outcome["status"], "ok");
    assert_eq!(rows[1].action, "extract_knowledge");
    assert_eq!(rows[1].outcome["status"], "error");
    assert_eq!(rows[1].outcome["code"], "schema");
    assert_eq!(rows[0].input_hash.len(), 64);
}

#[test]
fn worker_finishes_once_every_clone_is_dropped() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("actions.jsonl");

    let (sink, worker) = JsonlActionSink::new(&path).unwrap();
    let clone = sink.clone();
    drop(sink);
    clone
        .record(make_record(Uuid::new_v4(), AgentAction::Decide, ActionOutcome::Ok))
        .unwrap();
    drop(clone);

    worker.join().unwrap();
    let raw = std::fs::read_to_string(&path).unwrap();
    assert_eq!(raw.lines().count(), 1);
}

//! Integration tests driving the engine through the wire protocol: encoded
//! CALL frames in, DATA/EXC frames out, exactly as a host would.

use reckon::sandbox::{Sandbox, CALL, DATA, EXC};
use serde_json::json;

fn run_calls(calls: &[serde_json::Value]) -> Vec<(u8, serde_json::Value)> {
    let mut input = Vec::new();
    for call in calls {
        input.extend(rmp_serde::to_vec(&(CALL, call)).unwrap());
    }
    let mut output = Vec::new();
    let mut sandbox = Sandbox::new();
    sandbox.run(&mut input.as_slice(), &mut output).unwrap();

    let mut frames = Vec::new();
    let mut cursor = output.as_slice();
    while !cursor.is_empty() {
        let frame: (u8, serde_json::Value) = rmp_serde::from_read(&mut cursor).unwrap();
        frames.push(frame);
    }
    frames
}

#[test]
fn test_load_apply_fetch_cycle() {
    let frames = run_calls(&[
        json!(["load_empty"]),
        json!(["apply_user_actions", [
            ["AddTable", "Students", [
                {"id": "Name", "type": "Text", "isFormula": false},
                {"id": "State", "type": "Text", "isFormula": false},
                {"id": "StateCount", "type": "Int", "isFormula": true,
                 "formula": "len(Students.lookupRecords(State=$State))"},
            ]],
            ["BulkAddRecord", "Students", [null, null, null], {
                "Name": ["Al", "Bo", "Ca"],
                "State": ["NY", "NY", "IL"],
            }],
        ]]),
        json!(["fetch_table", "Students", true, null]),
    ]);

    assert!(frames.iter().all(|(code, _)| *code == DATA));
    let bundle = &frames[1].1;
    assert_eq!(bundle["retValues"][1], json!([1, 2, 3]));
    let table = &frames[2].1;
    assert_eq!(table[0], json!("TableData"));
    assert_eq!(table[3]["StateCount"], json!([2, 2, 1]));
}

#[test]
fn test_exc_frame_for_bad_submission() {
    let frames = run_calls(&[
        json!(["load_empty"]),
        json!(["apply_user_actions", [["AddColumn", "Nope", "x", {"type": "Int"}]]]),
        json!(["get_version"]),
    ]);
    assert_eq!(frames[0].0, DATA);
    assert_eq!(frames[1].0, EXC);
    let message = frames[1].1.as_str().unwrap();
    assert!(message.starts_with("SchemaError "), "got: {}", message);
    // The loop keeps serving after an error.
    assert_eq!(frames[2].0, DATA);
}

#[test]
fn test_undo_stream_round_trips_over_wire() {
    let setup = json!(["apply_user_actions", [
        ["AddTable", "T", [{"id": "v", "type": "Int", "isFormula": false}]],
        ["AddRecord", "T", null, {"v": 1}],
    ]]);
    let update = json!(["apply_user_actions", [["UpdateRecord", "T", 1, {"v": 2}]]]);

    let frames = run_calls(&[json!(["load_empty"]), setup.clone(), update]);
    let bundle = &frames[2].1;
    assert_eq!(bundle["stored"][0], json!(["BulkUpdateRecord", "T", [1], {"v": [2]}]));
    assert_eq!(bundle["undo"][0], json!(["BulkUpdateRecord", "T", [1], {"v": [1]}]));

    // Apply the undo in a fresh engine fed the same history.
    let undo = bundle["undo"].clone();
    let frames = run_calls(&[
        json!(["load_empty"]),
        setup,
        json!(["apply_user_actions", [["UpdateRecord", "T", 1, {"v": 2}]]]),
        json!(["apply_user_actions", [["ApplyUndoActions", undo]]]),
        json!(["fetch_table", "T", true, null]),
    ]);
    let table = &frames[4].1;
    assert_eq!(table[3]["v"], json!([1]));
}

#[test]
fn test_autocomplete_and_version() {
    let frames = run_calls(&[
        json!(["load_empty"]),
        json!(["apply_user_actions", [
            ["AddTable", "Pets", [{"id": "name", "type": "Text", "isFormula": false}]]]]),
        json!(["autocomplete", "$na", "Pets"]),
        json!(["get_version"]),
    ]);
    assert_eq!(frames[2].1, json!(["$name"]));
    assert!(frames[3].1.as_i64().unwrap() >= 1);
}

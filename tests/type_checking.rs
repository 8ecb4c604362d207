use pype::PypeError;
use pype::data::{Column, Data, DataKind, DataSet, Frame};
use pype::error::SchemaViolation;
use pype::type_checker::{TypeCheckerPipe, TypeCheckerRegistry};
use serde_json::json;

fn frame(columns: Vec<(&str, Column)>) -> Data {
    Data::Frame(Frame::new(columns).unwrap())
}

fn train() -> DataSet {
    let mut dataset = DataSet::new();
    dataset.insert(
        "x",
        frame(vec![
            ("age", Column::Int(vec![31, 45])),
            ("city", Column::from(vec!["Oslo", "Lima"])),
        ]),
    );
    dataset.insert("weight", Column::Float(vec![0.5, 1.5]));
    dataset
}

fn fitted(strict: bool) -> TypeCheckerPipe {
    let mut checker =
        TypeCheckerPipe::new("input", vec!["x".into(), "weight".into()]).strict(strict);
    checker
        .fit(&train(), &TypeCheckerRegistry::with_defaults())
        .unwrap();
    checker
}

#[test]
fn schema_round_trip_drops_extra_fields() {
    let checker = fitted(false);
    let mut incoming = train();
    incoming.insert(
        "x",
        frame(vec![
            ("age", Column::Int(vec![22])),
            ("city", Column::from(vec!["Rome"])),
            ("shoe_size", Column::Int(vec![42])),
        ]),
    );
    incoming.insert("weight", Column::Float(vec![2.0]));

    let checked = checker.transform(&incoming, true).unwrap();
    let schema = checker.schema().unwrap();
    let round_trip = schema.to_model(&checked).unwrap().convert().unwrap();

    let expected = frame(vec![
        ("age", Column::Int(vec![22])),
        ("city", Column::from(vec!["Rome"])),
    ]);
    assert_eq!(round_trip.get("x"), Some(&expected));
    assert_eq!(round_trip.get("weight"), checked.get("weight"));
}

#[test]
fn strict_checkers_reject_extra_fields_only_at_inference() {
    let checker = fitted(true);
    let mut incoming = train();
    incoming.insert(
        "x",
        frame(vec![
            ("age", Column::Int(vec![22])),
            ("city", Column::from(vec!["Rome"])),
            ("shoe_size", Column::Int(vec![42])),
        ]),
    );

    assert!(checker.transform(&incoming, false).is_ok());
    let err = checker.transform(&incoming, true).unwrap_err();
    assert!(matches!(
        err,
        PypeError::SchemaValidation(SchemaViolation::UnexpectedField { .. })
    ));
}

#[test]
fn wire_requests_are_validated_field_by_field() {
    let schema = fitted(false).schema().unwrap();

    let parsed = schema
        .parse(&json!({"x": {"age": [50], "city": ["Kyiv"]}, "weight": [1.0]}))
        .unwrap()
        .convert()
        .unwrap();
    assert_eq!(parsed.len(), 2);

    let missing = schema
        .parse(&json!({"x": {"age": [50]}, "weight": [1.0]}))
        .unwrap_err();
    assert!(matches!(
        missing,
        PypeError::SchemaValidation(SchemaViolation::MissingField { ref field }) if field == "x.city"
    ));

    let wrong_type = schema
        .parse(&json!({"x": {"age": ["old"], "city": ["Kyiv"]}, "weight": [1.0]}))
        .unwrap_err();
    assert!(wrong_type.is_schema_violation());

    let rendered = schema.json_schema();
    assert_eq!(rendered["properties"]["x"]["type"], "object");
}

#[test]
fn checker_pipes_serialise_with_their_fitted_state() {
    let checker = fitted(false);
    let text = serde_json::to_string(&checker).unwrap();
    let restored: TypeCheckerPipe = serde_json::from_str(&text).unwrap();
    assert_eq!(restored, checker);
    assert!(restored.is_fitted());
}

#[test]
fn registry_resolves_by_data_kind() {
    let registry = TypeCheckerRegistry::with_defaults();
    assert!(registry.resolve(DataKind::Frame).is_ok());
    let err = registry.resolve(DataKind::Json).unwrap_err();
    assert!(err.to_string().contains("json"));

    let mut unfitted = TypeCheckerPipe::new("input", vec!["x".into()]);
    assert!(matches!(
        unfitted.transform(&train(), true),
        Err(PypeError::UnfittedOperator(_))
    ));
    let mut json_only = DataSet::new();
    json_only.insert("x", Data::Json(json!({"nested": {"deep": true}})));
    assert!(unfitted.fit(&json_only, &registry).is_err());
}

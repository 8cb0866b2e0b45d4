use keel_config::json_schema;

#[test]
fn schema_describes_build_settings() {
    let schema = serde_json::to_value(json_schema()).expect("schema serializes");
    let properties = &schema["properties"];
    assert!(properties.get("logging").is_some());
    assert!(properties.get("build_settings").is_some());

    let definitions = &schema["definitions"];
    let build = &definitions["BuildSettingsConfig"]["properties"];
    assert_eq!(build["settings_timeout_ms"]["minimum"], serde_json::json!(1.0));
    assert!(definitions.get("PreparationMode").is_some());
}

use heliograph::Config;

#[test]
fn yaml_file_roundtrip_preserves_sites() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("heliograph_config.yaml");

    let yaml = r#"
api:
  host: "https://api.solcast.com.au"
  request_timeout_secs: 60
sites:
  - resource_id: "aaaa-bbbb-cccc-dddd"
    api_key: "key-1"
    name: "North roof"
  - resource_id: "eeee-ffff-gggg-hhhh"
    api_key: "key-1"
    exclude_from_totals: true
refresh:
  auto_update: true
  interval_minutes: 120
  guard_minutes: 15
  fetch_timeout_secs: 900
  attempts: 10
  busy_cooldown_secs: 55
  transient_backoff_secs: 5
storage:
  data_dir: "/data/heliograph"
logging:
  level: "INFO"
  file: "/tmp/heliograph.log"
  backup_count: 5
  console_output: true
  json_format: false
timezone: "Australia/Sydney"
"#;
    std::fs::write(&path, yaml).unwrap();

    let config = Config::from_file(&path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.sites.len(), 2);
    assert_eq!(config.sites[0].name.as_deref(), Some("North roof"));
    assert!(!config.sites[0].exclude_from_totals);
    assert!(config.sites[1].exclude_from_totals);
    assert_eq!(config.sites[0].daily_limit, 10);
    assert_eq!(config.tz().unwrap(), chrono_tz::Australia::Sydney);

    // The two sites share one credential
    assert_eq!(config.credentials().len(), 1);
}

#[test]
fn missing_file_is_an_error() {
    assert!(Config::from_file("/nonexistent/heliograph.yaml").is_err());
}

#[test]
fn save_then_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.yaml");
    let config = Config::default();
    config.save_to_file(&path).unwrap();
    let loaded = Config::from_file(&path).unwrap();
    assert_eq!(loaded.timezone, "UTC");
    assert_eq!(loaded.refresh.interval_minutes, 120);
}

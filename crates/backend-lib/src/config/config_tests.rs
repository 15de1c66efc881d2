use super::*;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_default_settings_are_valid() {
    let settings = Settings::default();
    assert!(settings.validate().is_ok());
    assert_eq!(settings.bind_addr.to_string(), "127.0.0.1:3000");
    assert_eq!(settings.log_format, LogFormat::Text);
}

#[test]
fn test_settings_validation() {
    let settings = Settings::default();

    let mut invalid = settings.clone();
    invalid.log_level = "chatty".to_string();
    assert!(invalid.validate().is_err());

    let mut invalid = settings.clone();
    invalid.recording.chunk_queue_depth = 0;
    assert!(invalid.validate().is_err());

    let mut invalid = settings.clone();
    invalid.recording.reorder_window = 0;
    assert!(invalid.validate().is_err());

    let mut invalid = settings.clone();
    invalid.merge.frame_width = 641;
    assert!(invalid.validate().is_err());

    let mut invalid = settings.clone();
    invalid.merge.crf = 52;
    assert!(invalid.validate().is_err());

    let mut upper = settings;
    upper.log_level = "DEBUG".to_string();
    assert!(upper.validate().is_ok());
}

#[test]
fn test_load_from_toml_overrides_defaults() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
bind_addr = "0.0.0.0:8443"
data_dir = "/var/lib/duet"
log_format = "json"

[recording]
chunk_queue_depth = 4

[merge]
frame_width = 1280
frame_height = 720
"#
    )
    .unwrap();

    let settings = Settings::load_from(file.path()).unwrap();
    assert_eq!(settings.bind_addr.to_string(), "0.0.0.0:8443");
    assert_eq!(settings.data_dir, PathBuf::from("/var/lib/duet"));
    assert_eq!(settings.log_format, LogFormat::Json);
    assert_eq!(settings.recording.chunk_queue_depth, 4);
    // untouched nested keys keep their defaults
    assert_eq!(settings.recording.reorder_window, RecordingSettings::default().reorder_window);
    assert_eq!(settings.merge.frame_width, 1280);
    assert_eq!(settings.merge.crf, 23);
}

#[test]
fn test_load_from_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(settings.recording, RecordingSettings::default());
}

#[test]
fn test_load_from_rejects_invalid_values() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[merge]\nframe_height = 0").unwrap();
    assert!(matches!(
        Settings::load_from(file.path()),
        Err(AppError::Config(_))
    ));
}

use filetx_core::{EngineConfig, OpsError, SchedulerConfig};
use std::path::PathBuf;

#[test]
fn test_engine_config_builder_defaults() {
    let config = EngineConfig::builder().data_dir("/data").build().unwrap();
    assert_eq!(config.undo_capacity, 50);
    assert_eq!(config.stash_max_files, 200);
    assert_eq!(config.backup_retries, 10);
    assert!(config.chunk_width.is_none());
}

#[test]
fn test_effective_chunk_width_is_bounded() {
    let width = EngineConfig::new("/data").effective_chunk_width();
    assert!((4..=16).contains(&width));

    let mut config = EngineConfig::new("/data");
    config.chunk_width = Some(1);
    assert_eq!(config.effective_chunk_width(), 4);
}

#[test]
fn test_scheduler_default_pool() {
    let config = SchedulerConfig::default();
    let workers = config.effective_workers();
    assert!(workers >= 1);
    assert!(workers <= config.max_workers);
}

#[test]
fn test_error_messages_carry_paths() {
    let err = OpsError::SelfContainment {
        item: PathBuf::from("/src/dir"),
        destination: PathBuf::from("/src/dir/inner"),
    };
    let message = err.to_string();
    assert!(message.contains("/src/dir"));
    assert!(message.contains("/src/dir/inner"));

    let err = OpsError::TargetExists {
        path: PathBuf::from("/a/b.txt"),
    };
    assert_eq!(err.to_string(), "Target already exists: /a/b.txt");
}

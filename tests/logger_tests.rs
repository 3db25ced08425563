use log::{Level, Log, Record};
use reactor_server::config::LogConfig;
use reactor_server::logger::AsyncLogger;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn file_config(dir: &Path, max_lines: usize) -> LogConfig {
    LogConfig {
        level: "debug".to_string(),
        directory: Some(dir.to_path_buf()),
        max_lines,
        ..LogConfig::default()
    }
}

fn read_logs(dir: &Path) -> Vec<(String, String)> {
    let mut files: Vec<(String, String)> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            (name, fs::read_to_string(&path).unwrap())
        })
        .collect();
    files.sort();
    files
}

#[test]
fn test_lines_roll_into_new_files() {
    let dir = tempdir().unwrap();
    let logger = AsyncLogger::new(&file_config(dir.path(), 3)).unwrap();

    for i in 0..7 {
        logger.record(Level::Info, format!("line {}", i));
    }
    logger.shutdown();

    let files = read_logs(dir.path());
    assert!(files.len() >= 3, "expected rolled files, got {:?}", files);
    for (name, content) in &files {
        assert!(name.ends_with("_server.log"), "unexpected file {}", name);
        assert!(content.lines().count() <= 3);
    }

    let lines: Vec<String> = files
        .iter()
        .flat_map(|(_, content)| content.lines().map(str::to_string).collect::<Vec<_>>())
        .collect();
    assert_eq!(lines.len(), 7);
    for line in &lines {
        assert!(line.contains(" [info] : line "), "bad line {:?}", line);
    }
}

#[test]
fn test_level_tags_and_timestamp() {
    let dir = tempdir().unwrap();
    let logger = AsyncLogger::new(&file_config(dir.path(), 100)).unwrap();

    logger.record(Level::Error, "e");
    logger.record(Level::Warn, "w");
    logger.record(Level::Debug, "d");
    logger.flush();

    let files = read_logs(dir.path());
    assert_eq!(files.len(), 1);
    let lines: Vec<&str> = files[0].1.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].ends_with("[error]: e"));
    assert!(lines[1].ends_with("[warn] : w"));
    assert!(lines[2].ends_with("[debug]: d"));

    // "YYYY-MM-DD HH:MM:SS.ffffff "
    let stamp = &lines[0][..27];
    assert_eq!(stamp.as_bytes()[4], b'-');
    assert_eq!(stamp.as_bytes()[10], b' ');
    assert_eq!(stamp.as_bytes()[19], b'.');
    assert_eq!(stamp.as_bytes()[26], b' ');
}

#[test]
fn test_log_facade_handle_respects_level() {
    let dir = tempdir().unwrap();
    let config = LogConfig {
        level: "warn".to_string(),
        ..file_config(dir.path(), 100)
    };
    let logger = AsyncLogger::new(&config).unwrap();
    let handle = logger.handle();

    handle.log(
        &Record::builder()
            .level(Level::Warn)
            .args(format_args!("kept {}", 1))
            .build(),
    );
    handle.log(
        &Record::builder()
            .level(Level::Info)
            .args(format_args!("filtered"))
            .build(),
    );
    handle.flush();

    let files = read_logs(dir.path());
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].1.lines().count(), 1);
    assert!(files[0].1.contains("[warn] : kept 1"));
}

#[test]
fn test_shutdown_is_idempotent() {
    let dir = tempdir().unwrap();
    let logger = AsyncLogger::new(&file_config(dir.path(), 10)).unwrap();
    logger.record(Level::Info, "before");
    logger.shutdown();
    logger.shutdown();

    // lines after shutdown are discarded, not queued forever
    logger.record(Level::Info, "after");
    let content: String = read_logs(dir.path()).into_iter().map(|(_, c)| c).collect();
    assert!(content.contains("before"));
    assert!(!content.contains("after"));
}

#[test]
fn test_unknown_level_is_rejected() {
    let config = LogConfig {
        level: "loud".to_string(),
        ..LogConfig::default()
    };
    assert!(AsyncLogger::new(&config).is_err());
}

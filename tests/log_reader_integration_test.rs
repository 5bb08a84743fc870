use scribe::logs::{read_records, Level, LogReadOptions, LogRecord, LogStream};
use scribe::{LoggerRegistry, RegistrySettings};
use std::io;
use tempfile::TempDir;
use tokio::time::{timeout, Duration};

#[tokio::test]
async fn test_read_back_written_records() {
    let temp_dir = TempDir::new().unwrap();
    let registry = LoggerRegistry::new(RegistrySettings::default());
    let handle = registry.get_or_create("reader", temp_dir.path()).await.unwrap();

    handle.info("service started");
    handle.warn("disk at 91%");
    let cause = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
    handle.exception_with("request failed", &cause);

    // Flush everything to disk
    assert!(handle.stop().await);

    let records = read_records(handle.file_path(), &LogReadOptions::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 3);

    assert_eq!(records[0].level, Some(Level::Info));
    assert_eq!(records[0].message, "service started");
    assert!(records[0].timestamp().is_some());

    assert_eq!(records[1].level, Some(Level::Warning));
    assert_eq!(records[1].message, "disk at 91%");

    assert_eq!(records[2].level, Some(Level::Exception));
    assert_eq!(records[2].error_message.as_deref(), Some("short read"));
    assert_eq!(records[2].stack_trace.first().map(String::as_str), Some("short read"));
}

#[tokio::test]
async fn test_read_with_level_filter() {
    let temp_dir = TempDir::new().unwrap();
    let registry = LoggerRegistry::new(RegistrySettings::default());
    let handle = registry.get_or_create("mixed", temp_dir.path()).await.unwrap();

    for i in 0..20 {
        if i % 4 == 0 {
            handle.error(&format!("failure {}", i));
        } else {
            handle.log(&format!("step {}", i));
        }
    }
    assert!(handle.stop().await);

    let options = LogReadOptions {
        lines: 2,
        level: Some(Level::Error),
        filter: None,
    };
    let records = read_records(handle.file_path(), &options).await.unwrap();
    let messages: Vec<&str> = records.iter().map(|r| r.message.as_str()).collect();
    assert_eq!(messages, vec!["failure 12", "failure 16"]);
}

#[tokio::test]
async fn test_follow_live_logger() {
    let temp_dir = TempDir::new().unwrap();
    let registry = LoggerRegistry::new(RegistrySettings::default());
    let handle = registry.get_or_create("live", temp_dir.path()).await.unwrap();

    let options = LogReadOptions {
        filter: Some("tick".to_string()),
        ..LogReadOptions::default()
    };
    let mut stream = LogStream::follow(handle.file_path().to_path_buf(), options);

    handle.info("noise");
    for i in 0..3 {
        handle.info(&format!("tick {}", i));
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        let record: LogRecord = timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for record")
            .expect("stream ended");
        received.push(record.message);
    }
    assert_eq!(received, vec!["tick 0", "tick 1", "tick 2"]);

    registry.shutdown_all(Duration::from_secs(5)).await;
}

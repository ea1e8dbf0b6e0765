//! Queue Engine Scenarios
//!
//! End-to-end behavior of live and replay queues against real log files.

use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tunnel_core::{
    Application, Envelope, EventQueue, HandlerError, LogLayout, QueueConfig, QueueError,
};

const WAIT: Duration = Duration::from_secs(2);

fn ev(topic: &str, payload: &str) -> String {
    Envelope::new(topic, payload).to_line()
}

fn non_blank_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}

fn write_source(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, lines.join("\n")).unwrap();
    path
}

async fn wait_for_quit(queue: &EventQueue) {
    tokio::time::timeout(WAIT, queue.quit().wait())
        .await
        .expect("timeout waiting for quit");
}

struct Claims(&'static str);

impl Application for Claims {
    fn accepts(&self, topic: &str) -> bool {
        topic.contains(self.0)
    }

    fn handle(&self, envelope: Envelope) -> Result<Envelope, HandlerError> {
        Ok(envelope)
    }
}

struct Upcase;

impl Application for Upcase {
    fn accepts(&self, topic: &str) -> bool {
        topic == "shout"
    }

    fn handle(&self, envelope: Envelope) -> Result<Envelope, HandlerError> {
        Ok(Envelope::new(envelope.topic.to_uppercase(), envelope.payload))
    }
}

// -----------------------------------------------------------------------------
// Live mode
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_live_writes_timestamped_and_latest_files() {
    let root = tempfile::tempdir().unwrap();
    let queue = EventQueue::live(QueueConfig::with_root(root.path())).unwrap();

    queue.enqueue(r#"{"k":"v"}"#).await.unwrap();
    queue.flush().await.unwrap();

    let layout = LogLayout::new(root.path(), &Local::now());
    for latest in [layout.latest_input(), layout.latest_output()] {
        let meta = std::fs::symlink_metadata(&latest).expect("latest file exists");
        assert!(meta.file_type().is_file(), "{} should be a regular file", latest.display());
    }

    let names: Vec<String> = std::fs::read_dir(layout.day_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().any(|n| n.starts_with("input_") && n.ends_with(".log")));
    assert!(names.iter().any(|n| n.starts_with("output_") && n.ends_with(".log")));

    assert_eq!(non_blank_lines(&layout.latest_input()), vec![r#"{"k":"v"}"#]);
    let out = non_blank_lines(&layout.latest_output());
    assert_eq!(out.len(), 1);
    assert!(out[0].contains(r#""topic":"error""#));
}

#[tokio::test]
async fn test_live_one_to_one_input_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = EventQueue::live(QueueConfig::with_root(dir.path())).unwrap();

    let input_log = dir.path().join("one_to_one_input.log");
    let output_log = dir.path().join("one_to_one_output.log");
    queue.set_input_log(&input_log).await.unwrap();
    queue.set_output_log(&output_log).await.unwrap();

    let inputs = [
        ev("t", r#"{"id":1}"#),
        ev("t", r#"{"id":2}"#),
        ev("t", r#"{"id":3}"#),
        ev("t", "not json"),
        ev("", r#"{"id":4}"#),
        String::new(),
        "   ".to_string(),
    ];
    for item in inputs {
        queue.enqueue(item).await.unwrap();
    }
    queue.flush().await.unwrap();

    let input = non_blank_lines(&input_log);
    let output = non_blank_lines(&output_log);
    assert_eq!(input.len(), 5);
    assert_eq!(input.len(), output.len());

    let metrics = queue.metrics();
    assert_eq!(metrics.processed, 5);
    assert_eq!(metrics.rejected, 2);
}

#[tokio::test]
async fn test_blank_input_is_never_logged_or_published() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = EventQueue::live(QueueConfig::with_root(dir.path())).unwrap();
    let mut output = queue.take_output().unwrap();

    let input_log = dir.path().join("blank_input.log");
    let output_log = dir.path().join("blank_output.log");
    queue.set_input_log(&input_log).await.unwrap();
    queue.set_output_log(&output_log).await.unwrap();

    for blank in ["", "   ", "\t", "\n", " \r\n "] {
        queue.enqueue(blank).await.unwrap();
    }
    queue.flush().await.unwrap();

    assert!(non_blank_lines(&input_log).is_empty());
    assert!(std::fs::read_to_string(&output_log).unwrap().is_empty());
    assert!(output.try_recv().is_err());
    assert_eq!(queue.metrics().received, 0);
}

#[tokio::test]
async fn test_valid_then_invalid_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = EventQueue::live(QueueConfig::with_root(dir.path())).unwrap();
    let mut output = queue.take_output().unwrap();

    let output_log = dir.path().join("scenario_output.log");
    queue.set_output_log(&output_log).await.unwrap();

    let valid = r#"{"topic":"t","payload":"{\"id\":1}"}"#;
    let invalid = r#"{"topic":"t","payload":"not json"}"#;
    queue.enqueue(valid).await.unwrap();
    queue.enqueue(invalid).await.unwrap();
    queue.flush().await.unwrap();

    let lines = non_blank_lines(&output_log);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], valid);
    assert!(lines[1].contains(r#""topic":"error""#));
    assert!(lines[1].contains(r#"\"reason\":\"invalid_event\""#));

    let error = Envelope::parse(&lines[1]).unwrap();
    let payload: serde_json::Value = serde_json::from_str(&error.payload).unwrap();
    assert_eq!(payload["original"], invalid);

    // Only the valid envelope is published
    assert_eq!(output.recv().await.as_deref(), Some(valid));
    assert!(output.try_recv().is_err());
}

#[tokio::test]
async fn test_published_envelopes_are_valid() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = EventQueue::builder(QueueConfig::with_root(dir.path()))
        .application(Upcase)
        .live()
        .unwrap();
    let mut output = queue.take_output().unwrap();

    queue.enqueue(ev("shout", r#"{"msg":"hi"}"#)).await.unwrap();
    queue.enqueue(ev("quiet", r#"[1,2]"#)).await.unwrap();
    queue.enqueue(ev("tick", "7")).await.unwrap();

    let mut topics = Vec::new();
    for _ in 0..3 {
        let line = tokio::time::timeout(WAIT, output.recv()).await.unwrap().unwrap();
        let envelope = Envelope::parse(&line).expect("published envelope is valid");
        assert!(tunnel_event::is_valid_json(&envelope.payload));
        topics.push(envelope.topic);
    }
    assert_eq!(topics, vec!["SHOUT", "quiet", "tick"]);
}

#[tokio::test]
async fn test_routing_applications_and_invalid_cases() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = EventQueue::builder(QueueConfig::with_root(dir.path()))
        .application(Claims("1"))
        .application(Claims("2"))
        .shared_application(Arc::new(Claims("3")))
        .live()
        .unwrap();

    let output_log = dir.path().join("routing_output.log");
    queue.set_output_log(&output_log).await.unwrap();

    let processed = [
        r#"{"topic":"topic-1","payload":"{\"name\":\"user1\",\"action\":\"login\"}"}"#,
        r#"{"topic":"topic-2","payload":"{\"name\":\"user2\",\"action\":\"logout\"}"}"#,
        r#"{"topic":"topic-3","payload":"{\"name\":\"user3\",\"action\":\"login\"}"}"#,
        r#"{"topic":"other","payload":"{\"note\":\"no handler\"}"}"#,
    ];
    let invalid = [
        r#"{"topic":"topic-1","payload":"not json at all"}"#,
        r#"{"topic":"topic-2","payload":"{\"name\":\"broken\",\"action\":\"oops\""}"#,
        r#"{"payload":"{\"name\":\"user5\",\"amount\":99.99}"}"#,
        r#"{"name":"raw_no_envelope"}"#,
    ];

    for item in processed.iter().chain(invalid.iter()) {
        queue.enqueue(*item).await.unwrap();
    }
    queue.flush().await.unwrap();

    let lines = non_blank_lines(&output_log);
    assert_eq!(lines.len(), processed.len() + invalid.len());
    for (line, expected) in lines.iter().zip(processed.iter()) {
        assert_eq!(line, expected);
    }
    for line in &lines[processed.len()..] {
        assert!(line.contains(r#""topic":"error""#));
        assert!(line.contains(r#"\"reason\":\"invalid_event\""#));
    }
}

#[tokio::test]
async fn test_concurrent_producers() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = EventQueue::live(QueueConfig::with_root(dir.path())).unwrap();
    let mut output = queue.take_output().unwrap();

    let input_log = dir.path().join("concurrent_input.log");
    let output_log = dir.path().join("concurrent_output.log");
    queue.set_input_log(&input_log).await.unwrap();
    queue.set_output_log(&output_log).await.unwrap();

    let consumer = tokio::spawn(async move {
        let mut count = 0usize;
        while output.recv().await.is_some() {
            count += 1;
        }
        count
    });

    let mut producers = Vec::new();
    for p in 0..10 {
        let handle = queue.handle().unwrap();
        producers.push(tokio::spawn(async move {
            for i in 0..10 {
                let item = ev(&format!("producer-{p}"), &format!(r#"{{"seq":{i}}}"#));
                handle.enqueue(item).await.unwrap();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    queue.flush().await.unwrap();

    assert_eq!(non_blank_lines(&input_log).len(), 100);
    assert_eq!(non_blank_lines(&output_log).len(), 100);
    assert_eq!(queue.metrics().published, 100);

    queue.shutdown().await;
    assert_eq!(consumer.await.unwrap(), 100);
}

#[tokio::test]
async fn test_live_mode_never_raises_quit() {
    let dir = tempfile::tempdir().unwrap();
    let queue = EventQueue::live(QueueConfig::with_root(dir.path())).unwrap();

    queue.enqueue(ev("t", "{}")).await.unwrap();
    queue.flush().await.unwrap();

    let quit = queue.quit();
    assert!(tokio::time::timeout(Duration::from_millis(100), quit.wait())
        .await
        .is_err());
    assert!(!quit.is_raised());
}

#[tokio::test]
async fn test_output_backpressure_blocks_producers() {
    let dir = tempfile::tempdir().unwrap();
    let config = QueueConfig {
        output_capacity: 2,
        ..QueueConfig::with_root(dir.path())
    };
    let mut queue = EventQueue::live(config).unwrap();
    let mut output = queue.take_output().unwrap();

    // Two fill the output stream, the third is held by the loop.
    for i in 0..3 {
        tokio::time::timeout(WAIT, queue.enqueue(ev("t", &i.to_string())))
            .await
            .expect("enqueue should not block yet")
            .unwrap();
    }

    // The loop cannot take a fourth item, so its producer waits.
    let handle = queue.handle().unwrap();
    let fourth = tokio::spawn(async move { handle.enqueue(ev("t", "3")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!fourth.is_finished(), "fourth enqueue should wait for the consumer");
    assert_eq!(queue.metrics().received, 3);

    assert!(output.recv().await.is_some());
    tokio::time::timeout(WAIT, fourth)
        .await
        .expect("enqueue resumes once the consumer drains")
        .unwrap()
        .unwrap();
    assert_eq!(queue.metrics().received, 4);
}

#[tokio::test]
async fn test_enqueue_returns_only_after_loop_takes_item() {
    let dir = tempfile::tempdir().unwrap();
    let config = QueueConfig {
        output_capacity: 1,
        ..QueueConfig::with_root(dir.path())
    };
    let mut queue = EventQueue::live(config).unwrap();
    let _output = queue.take_output().unwrap();

    let input_log = dir.path().join("handoff_input.log");
    queue.set_input_log(&input_log).await.unwrap();

    // One is published, one is held by the blocked loop.
    queue.enqueue(ev("t", "1")).await.unwrap();
    queue.enqueue(ev("t", "2")).await.unwrap();

    let third = tokio::time::timeout(Duration::from_millis(200), queue.enqueue(ev("t", "3"))).await;
    assert!(third.is_err(), "third enqueue must not return before the loop takes it");

    // Every accepted item was logged before stop.
    queue.shutdown().await;
    assert_eq!(non_blank_lines(&input_log), vec![ev("t", "1"), ev("t", "2")]);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_log_write_failure_does_not_stop_processing() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = EventQueue::live(QueueConfig::with_root(dir.path())).unwrap();
    let mut output = queue.take_output().unwrap();

    queue.set_output_log("/dev/full").await.unwrap();
    queue.enqueue(ev("t", r#"{"n":1}"#)).await.unwrap();
    queue.enqueue(ev("t", r#"{"n":2}"#)).await.unwrap();
    tokio::time::timeout(WAIT, queue.flush())
        .await
        .expect("flush should not stall")
        .unwrap();

    assert_eq!(output.recv().await, Some(ev("t", r#"{"n":1}"#)));
    assert_eq!(output.recv().await, Some(ev("t", r#"{"n":2}"#)));
    assert_eq!(queue.metrics().published, 2);
}

#[tokio::test]
async fn test_output_log_swap_takes_effect_between_items() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = EventQueue::live(QueueConfig::with_root(dir.path())).unwrap();

    let first = dir.path().join("first.log");
    let second = dir.path().join("second.log");

    queue.set_output_log(&first).await.unwrap();
    queue.enqueue(ev("t", r#"{"n":1}"#)).await.unwrap();
    queue.set_output_log(&second).await.unwrap();
    queue.enqueue(ev("t", r#"{"n":2}"#)).await.unwrap();
    queue.flush().await.unwrap();

    assert_eq!(non_blank_lines(&first), vec![ev("t", r#"{"n":1}"#)]);
    assert_eq!(non_blank_lines(&second), vec![ev("t", r#"{"n":2}"#)]);
}

#[tokio::test]
async fn test_set_log_to_missing_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = EventQueue::live(QueueConfig::with_root(dir.path())).unwrap();

    let err = queue
        .set_input_log(dir.path().join("no/such/dir/input.log"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Io(_)));
}

#[tokio::test]
async fn test_stop_closes_output_and_rejects_input() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = EventQueue::live(QueueConfig::with_root(dir.path())).unwrap();
    let mut output = queue.take_output().unwrap();
    let done = queue.done();

    queue.stop();
    assert!(done.is_raised());

    let closed = tokio::time::timeout(WAIT, output.recv()).await.unwrap();
    assert!(closed.is_none());
    assert!(matches!(
        queue.enqueue(ev("t", "{}")).await,
        Err(QueueError::Stopped)
    ));
}

// -----------------------------------------------------------------------------
// Replay mode
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_replay_three_valid_lines() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(
        dir.path(),
        "source.log",
        &[
            ev("t", r#"{"id":1}"#),
            ev("t", r#"{"id":2}"#),
            ev("t", r#"{"id":3}"#),
        ],
    );

    let mut queue = EventQueue::replay(QueueConfig::with_root(dir.path()));
    let mut output = queue.take_output().unwrap();
    let output_log = dir.path().join("replay_output.log");
    queue.set_output_log(&output_log).await.unwrap();

    queue.start_reading_log_file(&source).await.unwrap();
    wait_for_quit(&queue).await;

    let lines = non_blank_lines(&output_log);
    assert_eq!(lines.len(), 3);
    for line in &lines {
        assert!(Envelope::parse(line).is_ok());
    }

    let mut published = 0;
    while output.try_recv().is_ok() {
        published += 1;
    }
    assert_eq!(published, 3);
}

#[tokio::test]
async fn test_replay_quit_after_all_lines_processed() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(
        dir.path(),
        "mixed.log",
        &[
            ev("t", r#"{"id":1}"#),
            String::new(),
            ev("t", r#"{"id":2}"#),
            "   ".to_string(),
            ev("t", "not json"),
            ev("", r#"{"id":4}"#),
            ev("t", r#"{"id":5}"#),
            "\n".to_string(),
        ],
    );

    let mut queue = EventQueue::replay(QueueConfig::with_root(dir.path()));
    let input_log = dir.path().join("replay_in.log");
    let output_log = dir.path().join("replay_out.log");
    queue.set_input_log(&input_log).await.unwrap();
    queue.set_output_log(&output_log).await.unwrap();

    queue.start_reading_log_file(&source).await.unwrap();
    wait_for_quit(&queue).await;

    let metrics = queue.metrics();
    assert_eq!(metrics.processed, 5);
    assert_eq!(metrics.rejected, 2);
    assert_eq!(non_blank_lines(&input_log).len(), 5);
    assert_eq!(non_blank_lines(&output_log).len(), 5);

    // Custom destinations suppress the debug mirrors
    let layout = LogLayout::new(dir.path(), &Local::now());
    assert!(!layout.debug_dir().exists());
}

#[tokio::test]
async fn test_replay_continues_past_non_utf8_line() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("binary.log");
    let mut bytes = Vec::new();
    bytes.extend_from_slice(ev("t", r#"{"id":1}"#).as_bytes());
    bytes.extend_from_slice(b"\n\xff\xfe garbage\r\n");
    bytes.extend_from_slice(ev("t", r#"{"id":3}"#).as_bytes());
    bytes.push(b'\n');
    bytes.extend_from_slice(ev("t", r#"{"id":4}"#).as_bytes());
    std::fs::write(&source, bytes).unwrap();

    let mut queue = EventQueue::replay(QueueConfig::with_root(dir.path()));
    let input_log = dir.path().join("binary_in.log");
    let output_log = dir.path().join("binary_out.log");
    queue.set_input_log(&input_log).await.unwrap();
    queue.set_output_log(&output_log).await.unwrap();

    queue.start_reading_log_file(&source).await.unwrap();
    wait_for_quit(&queue).await;

    let metrics = queue.metrics();
    assert_eq!(metrics.processed, 4);
    assert_eq!(metrics.rejected, 1);
    assert_eq!(non_blank_lines(&input_log).len(), 4);

    let output = non_blank_lines(&output_log);
    assert_eq!(output.len(), 4);
    assert!(output[1].contains(r#""topic":"error""#));
    assert_eq!(output[3], ev("t", r#"{"id":4}"#));
}

#[tokio::test]
async fn test_replay_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "empty.log", &[]);

    let mut queue = EventQueue::replay(QueueConfig::with_root(dir.path()));
    let output_log = dir.path().join("empty_out.log");
    queue.set_output_log(&output_log).await.unwrap();

    queue.start_reading_log_file(&source).await.unwrap();
    wait_for_quit(&queue).await;

    assert!(non_blank_lines(&output_log).is_empty());
    assert_eq!(queue.metrics().processed, 0);
}

#[tokio::test]
async fn test_replay_debug_files_use_latest_timestamp() {
    let root = tempfile::tempdir().unwrap();
    let layout = LogLayout::new(root.path(), &Local::now());
    std::fs::create_dir_all(layout.day_dir()).unwrap();

    std::fs::write(layout.input_log("000000"), format!("{}\n", ev("a", "1"))).unwrap();
    std::fs::write(layout.input_log("235959"), format!("{}\n", ev("b", "2"))).unwrap();
    std::fs::write(layout.latest_input(), format!("{}\n", ev("b", "2"))).unwrap();

    let mut queue = EventQueue::replay(QueueConfig::with_root(root.path()));
    queue
        .start_reading_log_file(layout.latest_input())
        .await
        .unwrap();
    wait_for_quit(&queue).await;

    let debug_in = layout.debug_input("235959");
    let debug_out = layout.debug_output("235959");
    assert_eq!(non_blank_lines(&debug_in), vec![ev("b", "2")]);
    assert_eq!(non_blank_lines(&debug_out), vec![ev("b", "2")]);
}

#[tokio::test]
async fn test_replay_timestamped_source_names_debug_files() {
    let root = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    let source = write_source(elsewhere.path(), "input_101112.log", &[ev("t", "{}")]);

    let mut queue = EventQueue::replay(QueueConfig::with_root(root.path()));
    queue.start_reading_log_file(&source).await.unwrap();
    wait_for_quit(&queue).await;

    // Debug mirrors live under the simulations root, not beside the source
    let layout = LogLayout::new(root.path(), &Local::now());
    assert!(layout.debug_input("101112").exists());
    assert!(layout.debug_output("101112").exists());
    assert!(!elsewhere.path().join("debug").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_replay_follows_symlink() {
    let root = tempfile::tempdir().unwrap();
    let source = write_source(root.path(), "input_080000.log", &[ev("t", "{}")]);
    let link = root.path().join("current");
    std::os::unix::fs::symlink(&source, &link).unwrap();

    let mut queue = EventQueue::replay(QueueConfig::with_root(root.path()));
    queue.start_reading_log_file(&link).await.unwrap();
    wait_for_quit(&queue).await;

    let layout = LogLayout::new(root.path(), &Local::now());
    assert!(layout.debug_output("080000").exists());
}

#[tokio::test]
async fn test_replay_stop_before_completion() {
    let dir = tempfile::tempdir().unwrap();
    let lines: Vec<String> = (0..50).map(|i| ev("t", &i.to_string())).collect();
    let source = write_source(dir.path(), "long.log", &lines);

    let config = QueueConfig {
        output_capacity: 1,
        ..QueueConfig::with_root(dir.path())
    };
    let mut queue = EventQueue::replay(config);
    let _output = queue.take_output().unwrap();
    queue.start_reading_log_file(&source).await.unwrap();

    // Nobody drains the output stream, so the replay stalls until stopped
    tokio::time::sleep(Duration::from_millis(50)).await;
    let quit = queue.quit();
    queue.shutdown().await;
    assert!(!quit.is_raised());
}

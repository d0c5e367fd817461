//! End-to-end log pipeline tests: writer, rotation, filter, events

use std::path::Path;
use std::time::Duration;

use switchboard::{
    EventFilterParser, ExpectOptions, MockTransport, SendOptions, Switchboard, SwitchboardBuilder,
};

async fn wait_for_contents(path: &Path, needle: &str) -> String {
    for _ in 0..800 {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if contents.contains(needle) {
                return contents;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "{} never contained {:?}: {:?}",
        path.display(),
        needle,
        std::fs::read_to_string(path).ok()
    );
}

fn power_filter(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("power.json");
    std::fs::write(
        &path,
        r#"{"filters": [{"name": "state", "regex_match": "power:(\\w+)"}]}"#,
    )
    .unwrap();
    path
}

async fn filtered_switchboard(dir: &Path, max_log_size: u64) -> (Switchboard, MockTransport) {
    let parser = EventFilterParser::from_filter_files(&[power_filter(dir)]).unwrap();
    let mock = MockTransport::new();
    let switchboard = SwitchboardBuilder::new("lightbulb", dir.join("lightbulb.txt"))
        .transport(Box::new(mock.clone()))
        .parser(Box::new(parser))
        .max_log_size(max_log_size)
        .build()
        .await
        .unwrap();
    (switchboard, mock)
}

#[tokio::test]
async fn test_device_output_lands_stamped_in_log() {
    let dir = tempfile::tempdir().unwrap();
    let (switchboard, mock) = filtered_switchboard(dir.path(), 0).await;

    mock.enqueue_read("hello from device\n");
    let log = wait_for_contents(&dir.path().join("lightbulb.txt"), "hello from device").await;
    assert!(log.contains("GDM-0: hello from device\n"), "log {:?}", log);
    switchboard.close().await;
}

#[tokio::test]
async fn test_sent_commands_are_noted_in_log() {
    let dir = tempfile::tempdir().unwrap();
    let (switchboard, _mock) = filtered_switchboard(dir.path(), 0).await;

    switchboard.send("reboot", &SendOptions::default()).unwrap();
    let log = wait_for_contents(&dir.path().join("lightbulb.txt"), "reboot").await;
    assert!(log.contains("GDM-M: Note: wrote command \"reboot\" to port 0"));
    switchboard.close().await;
}

#[tokio::test]
async fn test_partial_line_is_tagged_no_eol() {
    let dir = tempfile::tempdir().unwrap();
    let (switchboard, mock) = filtered_switchboard(dir.path(), 0).await;

    mock.enqueue_read("stuck prompt> ");
    let log = wait_for_contents(&dir.path().join("lightbulb.txt"), "[NO EOL]").await;
    assert!(log.contains("stuck prompt> [NO EOL]\n"), "log {:?}", log);
    switchboard.close().await;
}

#[tokio::test]
async fn test_log_rotation_keeps_event_stream_flowing() {
    let dir = tempfile::tempdir().unwrap();
    // A tiny cap forces rotation on the first line.
    let (switchboard, mock) = filtered_switchboard(dir.path(), 64).await;

    mock.enqueue_read("power:ON\n");
    wait_for_contents(&dir.path().join("lightbulb.txt"), "Rotating from log file").await;

    mock.enqueue_read("power:OFF\n");
    let rotated = wait_for_contents(&dir.path().join("lightbulb.00001.txt"), "power:OFF").await;
    assert!(rotated.contains("GDM-0: power:OFF\n"));

    // Events from both files land in the original event file.
    let events = wait_for_contents(&dir.path().join("lightbulb-events.txt"), "OFF").await;
    assert!(events.contains("\"ON\""));
    assert!(events.contains("lightbulb.00001.txt"));
    switchboard.close().await;
}

#[tokio::test]
async fn test_start_new_log_switches_writer_and_filter() {
    let dir = tempfile::tempdir().unwrap();
    let (switchboard, mock) = filtered_switchboard(dir.path(), 0).await;

    mock.enqueue_read("power:ON\n");
    wait_for_contents(&dir.path().join("lightbulb-events.txt"), "ON").await;

    let fresh = dir.path().join("fresh.txt");
    switchboard.start_new_log(fresh.clone()).await.unwrap();
    let old = wait_for_contents(&dir.path().join("lightbulb.txt"), "Starting new log file").await;
    assert!(old.contains(&fresh.display().to_string()));

    mock.enqueue_read("power:OFF\n");
    let log = wait_for_contents(&fresh, "power:OFF").await;
    assert!(log.contains("GDM-0: power:OFF\n"));
    // The event stream moves with the log.
    let events = wait_for_contents(&dir.path().join("fresh-events.txt"), "OFF").await;
    assert!(events.contains("power.state"));
    switchboard.close().await;
}

#[tokio::test]
async fn test_add_new_filter_applies_to_later_lines() {
    let dir = tempfile::tempdir().unwrap();
    let (switchboard, mock) = filtered_switchboard(dir.path(), 0).await;

    let extra = dir.path().join("net.json");
    std::fs::write(
        &extra,
        r#"{"filters": [{"name": "up", "regex_match": "link up on (\\w+)"}]}"#,
    )
    .unwrap();
    switchboard.add_new_filter(extra).await.unwrap();

    mock.enqueue_read("link up on eth0\n");
    let events = wait_for_contents(&dir.path().join("lightbulb-events.txt"), "net.up").await;
    assert!(events.contains("eth0"));
    switchboard.close().await;
}

#[tokio::test]
async fn test_expect_outcome_is_noted_in_log() {
    let dir = tempfile::tempdir().unwrap();
    let (switchboard, mock) = filtered_switchboard(dir.path(), 0).await;

    let response = switchboard
        .do_and_expect(
            || async {
                mock.enqueue_read("power:ON\n");
                Ok(())
            },
            &["power:(\\w+)".to_string()],
            &ExpectOptions::default().timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert!(!response.timedout);

    let log = wait_for_contents(&dir.path().join("lightbulb.txt"), "found pattern").await;
    assert!(
        log.contains(r#"GDM-M: Note: found pattern "power:(\\w+)" at index 0"#),
        "log {:?}",
        log
    );
    assert!(log.contains("Note: expect completed after"));
    switchboard.close().await;
}

#[tokio::test]
async fn test_set_max_log_size_is_noted_and_applied() {
    let dir = tempfile::tempdir().unwrap();
    let (switchboard, mock) = filtered_switchboard(dir.path(), 0).await;

    switchboard.set_max_log_size(64).await.unwrap();
    wait_for_contents(&dir.path().join("lightbulb.txt"), "Changing max_log_size").await;

    mock.enqueue_read("filler line one\n");
    mock.enqueue_read("filler line two\n");
    wait_for_contents(&dir.path().join("lightbulb.00001.txt"), "filler").await;
    switchboard.close().await;
}

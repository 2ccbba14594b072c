use std::time::Duration;

use envbus_core::memory::Faults;
use envbus_core::{Action, MemoryBus, StateFrame};
use envbus_session::{
    FrameRecorder, MasterConfig, MasterConn, Received, Session, SessionConfig, StateMonitor,
};

const PREFIX: &str = "qwop-worker";
const OBS: usize = 4;

fn master_config() -> MasterConfig {
    MasterConfig {
        obs_size: OBS,
        poll_interval: Duration::from_millis(20),
        ..MasterConfig::default()
    }
}

/// Poll until the reader task has picked up `n` states.
async fn wait_for_states(master: &MasterConn, n: usize) -> Vec<envbus_session::StateUpdate> {
    let mut seen = Vec::new();
    for _ in 0..200 {
        seen.extend(master.read_states().unwrap());
        if seen.len() >= n {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("only {} of {n} states arrived", seen.len());
}

#[tokio::test]
async fn master_announces_itself_to_running_workers() {
    let bus = MemoryBus::new();
    let mut worker = Session::connect(&bus, "memory", PREFIX, &SessionConfig::default())
        .await
        .unwrap();

    let master = MasterConn::establish(&bus, "memory", PREFIX, &master_config())
        .await
        .unwrap();

    assert_eq!(worker.receive_act().await.unwrap(), Received::NewMaster);
    assert_eq!(
        bus.published_on(&format!("{PREFIX}:master-ready")),
        vec!["ready"]
    );
    master.close().await.unwrap();
}

#[tokio::test]
async fn states_flow_up_and_actions_flow_down() {
    let bus = MemoryBus::new();
    let mut master = MasterConn::establish(&bus, "memory", PREFIX, &master_config())
        .await
        .unwrap();
    let mut worker = Session::connect(&bus, "memory", PREFIX, &SessionConfig::default())
        .await
        .unwrap();

    let frame = StateFrame {
        reward: 2.5,
        done: true,
        ..StateFrame::blank(OBS).unwrap()
    };
    worker.send_state(&frame.encode()).await.unwrap();

    let states = wait_for_states(&master, 1).await;
    assert_eq!(&states[0].env_id, worker.env_id());
    assert_eq!(states[0].frame.reward, 2.5);
    assert!(states[0].is_new_episode());

    let action = Action::from([true, true, false, true]);
    master
        .send_actions(&[(worker.env_id().clone(), action)])
        .await
        .unwrap();
    assert_eq!(worker.receive_act().await.unwrap(), Received::Action(action));

    worker.close().await.unwrap();
    master.close().await.unwrap();
    assert_eq!(bus.open_connections(), 0);
    assert_eq!(bus.open_subscriptions(), 0);
}

#[tokio::test]
async fn undersized_states_are_skipped() {
    let bus = MemoryBus::new();
    let master = MasterConn::establish(&bus, "memory", PREFIX, &master_config())
        .await
        .unwrap();
    let mut worker = Session::connect(&bus, "memory", PREFIX, &SessionConfig::default())
        .await
        .unwrap();

    worker.send_state(b"short").await.unwrap();
    worker
        .send_state(&StateFrame::blank(OBS).unwrap().encode())
        .await
        .unwrap();

    let states = wait_for_states(&master, 1).await;
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].frame.reward, 0.0);
    master.close().await.unwrap();
}

#[tokio::test]
async fn reader_failure_is_reported_by_read_states() {
    let bus = MemoryBus::new();
    let master = MasterConn::establish(&bus, "memory", PREFIX, &master_config())
        .await
        .unwrap();
    bus.disconnect_subscribers();

    let mut result = master.read_states();
    for _ in 0..200 {
        if result.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        result = master.read_states();
    }
    let err = result.unwrap_err();
    assert_eq!(err.error_kind(), "closed");
}

#[tokio::test(start_paused = true)]
async fn master_handshake_timeout_releases_connection() {
    let bus = MemoryBus::new();
    bus.set_faults(Faults {
        withhold_confirm: true,
        ..Faults::default()
    });
    let err = MasterConn::establish(&bus, "memory", PREFIX, &master_config())
        .await
        .err()
        .unwrap();
    assert!(err.bus_error().unwrap().is_timeout());
    assert_eq!(bus.open_connections(), 0);
    assert_eq!(bus.open_subscriptions(), 0);
    assert!(bus.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn monitor_reports_activity() {
    let bus = MemoryBus::new();
    let mut monitor = StateMonitor::establish(
        &bus,
        "memory",
        PREFIX,
        Duration::from_secs(10),
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    let mut worker = Session::connect(&bus, "memory", PREFIX, &SessionConfig::default())
        .await
        .unwrap();

    worker.send_state(b"abc").await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    let report = monitor.next_report().await.unwrap();
    assert!(report.env_ids.contains(worker.env_id()));
    assert_eq!(report.transitions, 1);
    assert_eq!(report.bytes, 3);
    assert_eq!(report.transitions_per_sec(), 0.5);
    monitor.close().await.unwrap();
}

#[tokio::test]
async fn recorder_writes_numbered_frames() {
    let bus = MemoryBus::new();
    let dir = tempfile::tempdir().unwrap();
    let out_dir = dir.path().join("movie");
    let mut recorder = FrameRecorder::establish(
        &bus,
        "memory",
        "qwop-frames",
        &out_dir,
        Duration::from_secs(10),
    )
    .await
    .unwrap();
    let mut worker = Session::connect(&bus, "memory", PREFIX, &SessionConfig::default())
        .await
        .unwrap();

    worker.send_raw_screen("qwop-frames", b"frame-0").await.unwrap();
    worker.send_raw_screen("qwop-frames", b"frame-1").await.unwrap();

    let first = recorder
        .record_next(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    let second = recorder
        .record_next(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, out_dir.join("000000.png"));
    assert_eq!(std::fs::read(&second).unwrap(), b"frame-1");
    assert_eq!(recorder.frames_written(), 2);

    assert!(recorder
        .record_next(Duration::from_millis(10))
        .await
        .unwrap()
        .is_none());
    recorder.close().await.unwrap();
}

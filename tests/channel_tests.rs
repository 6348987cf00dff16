mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use calcium::{
    client::{AccessRights, ClientConfig, ConnectionState, Context},
    dbr::{AlarmSeverity, AlarmStatus, DbrCategory, DbrValue},
};
use common::{MockServer, standard_pvs};
use tokio::time::{sleep, timeout};
use tracing::level_filters::LevelFilter;

const CONNECT_DEADLINE: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .try_init();
}

async fn test_context(server: &MockServer) -> Context {
    Context::with_config(
        ClientConfig::new()
            .search_addresses(vec![server.search_address])
            .watch_beacons(false),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn nonexistent_channel_never_connects() {
    init_logging();
    let server = MockServer::start(standard_pvs()).await;
    let context = test_context(&server).await;

    let channel = context
        .create_channel::<f64>("no_such_channel_test")
        .unwrap();
    assert_eq!(channel.name(), "no_such_channel_test");
    assert_eq!(channel.connection_state(), ConnectionState::NeverConnected);

    // Nobody answers the search, so the connect wait runs into our deadline
    assert!(
        timeout(Duration::from_secs(2), channel.connect())
            .await
            .is_err()
    );
    assert_eq!(channel.connection_state(), ConnectionState::NeverConnected);

    context.close().await;
    server.stop().await;
}

#[tokio::test]
async fn basic_connect_and_properties() {
    init_logging();
    let server = MockServer::start(standard_pvs()).await;
    let context = test_context(&server).await;

    let channel = context.create_channel::<f64>("adc01").unwrap();
    assert_eq!(channel.connection_state(), ConnectionState::NeverConnected);
    timeout(CONNECT_DEADLINE, channel.connect())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(channel.connection_state(), ConnectionState::Connected);
    assert_eq!(channel.name(), "adc01");

    let properties = channel.properties();
    assert_eq!(properties.native_type_code, 6);
    assert_eq!(properties.native_element_count, 2);
    assert_eq!(properties.native_type, "double");

    channel.close();
    assert_eq!(channel.connection_state(), ConnectionState::Closed);

    // A fresh handle for the same name connects again
    let channel = context.create_channel::<f64>("adc01").unwrap();
    assert_eq!(channel.connection_state(), ConnectionState::NeverConnected);
    timeout(CONNECT_DEADLINE, channel.connect())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(channel.connection_state(), ConnectionState::Connected);

    context.close().await;
    server.stop().await;
}

#[tokio::test]
async fn connection_listener_events() {
    init_logging();
    let server = MockServer::start(standard_pvs()).await;
    let context = test_context(&server).await;

    let channel = context.create_channel::<f64>("adc01").unwrap();

    let connected = Arc::new(AtomicUsize::new(0));
    let disconnected = Arc::new(AtomicUsize::new(0));
    let unregistered = Arc::new(AtomicUsize::new(0));

    let _l1 = channel.add_connection_listener({
        let connected = connected.clone();
        let disconnected = disconnected.clone();
        move |is_connected| {
            if is_connected {
                connected.fetch_add(1, Ordering::AcqRel);
            } else {
                disconnected.fetch_add(1, Ordering::AcqRel);
            }
        }
    });
    // A listener closed before anything happens sees no events at all
    let l2 = channel.add_connection_listener({
        let unregistered = unregistered.clone();
        move |_| {
            unregistered.fetch_add(1, Ordering::AcqRel);
        }
    });
    l2.close();

    timeout(CONNECT_DEADLINE, channel.connect())
        .await
        .unwrap()
        .unwrap();
    sleep(Duration::from_millis(500)).await;

    assert_eq!(connected.load(Ordering::Acquire), 1);
    assert_eq!(disconnected.load(Ordering::Acquire), 0);
    assert_eq!(unregistered.load(Ordering::Acquire), 0);

    // Explicit close is quiet: no disconnect event is delivered
    channel.close();
    sleep(Duration::from_millis(500)).await;
    assert_eq!(connected.load(Ordering::Acquire), 1);
    assert_eq!(disconnected.load(Ordering::Acquire), 0);
    assert_eq!(unregistered.load(Ordering::Acquire), 0);

    context.close().await;
    server.stop().await;
}

#[tokio::test]
async fn access_rights_listener_events() {
    init_logging();
    let server = MockServer::start(standard_pvs()).await;
    let context = test_context(&server).await;

    let channel = context.create_channel::<f64>("adc01").unwrap();
    let read_write_events = Arc::new(AtomicUsize::new(0));
    let _listener = channel.add_access_rights_listener({
        let read_write_events = read_write_events.clone();
        move |rights| {
            if rights == AccessRights::ReadWrite {
                read_write_events.fetch_add(1, Ordering::AcqRel);
            }
        }
    });

    timeout(CONNECT_DEADLINE, channel.connect())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(channel.access_rights(), AccessRights::ReadWrite);
    sleep(Duration::from_millis(500)).await;
    assert_eq!(read_write_events.load(Ordering::Acquire), 1);

    channel.close();
    sleep(Duration::from_millis(500)).await;
    assert_eq!(read_write_events.load(Ordering::Acquire), 1);

    context.close().await;
    server.stop().await;
}

#[tokio::test]
async fn put_and_get_round_trips() {
    init_logging();
    let server = MockServer::start(standard_pvs()).await;
    let context = test_context(&server).await;

    // Array channel: confirmed write, then read back
    let waveform = context.create_channel::<Vec<f64>>("adc01").unwrap();
    timeout(CONNECT_DEADLINE, waveform.connect())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(waveform.get().await.unwrap(), vec![0.0, 0.0]);
    waveform.put_async(vec![1.5, 2.5]).await.unwrap();
    assert_eq!(waveform.get().await.unwrap(), vec![1.5, 2.5]);

    // Scalar channel: the unacknowledged put is ordered ahead of the read
    // on the same circuit
    let counter = context.create_channel::<i32>("counter").unwrap();
    timeout(CONNECT_DEADLINE, counter.connect())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(counter.get().await.unwrap(), 0);
    counter.put(42).await.unwrap();
    assert_eq!(counter.get().await.unwrap(), 42);
    counter.put_no_wait(43).await.unwrap();
    assert_eq!(counter.get().await.unwrap(), 43);

    context.close().await;
    server.stop().await;
}

#[tokio::test]
async fn get_with_metadata_categories() {
    init_logging();
    let server = MockServer::start(standard_pvs()).await;
    let context = test_context(&server).await;

    let channel = context.create_channel::<f64>("adc01").unwrap();
    timeout(CONNECT_DEADLINE, channel.connect())
        .await
        .unwrap()
        .unwrap();

    let plain = channel.get_meta(DbrCategory::Basic).await.unwrap();
    assert_eq!(plain.value(), &DbrValue::Double(vec![0.0]));
    assert_eq!(plain.status(), None);

    let timestamped = channel.get_meta(DbrCategory::Time).await.unwrap();
    assert!(timestamped.timestamp().is_some());
    let alarm = timestamped.status().unwrap();
    assert_eq!(alarm.status, AlarmStatus::Udf);
    assert_eq!(alarm.severity, AlarmSeverity::Invalid);

    let control = channel.get_meta(DbrCategory::Control).await.unwrap();
    assert!(control.graphics().is_some());
    assert!(control.control().is_some());

    context.close().await;
    server.stop().await;
}

#[tokio::test]
async fn large_array_shift_round_trip() {
    init_logging();
    let server = MockServer::start(standard_pvs()).await;
    let context = Context::with_config(
        ClientConfig::new()
            .search_addresses(vec![server.search_address])
            .watch_beacons(false)
            .max_array_bytes(4 * 1024 * 1024 + 1024 + 32),
    )
    .await
    .unwrap();

    let channel = context.create_channel::<Vec<i32>>("large").unwrap();
    timeout(CONNECT_DEADLINE, channel.connect())
        .await
        .unwrap()
        .unwrap();

    let value = timeout(Duration::from_secs(10), channel.get())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value.len(), 1_048_576);
    for (i, element) in value.iter().enumerate() {
        assert_eq!(*element, i as i32);
    }

    const LARGE_PRIME: i32 = 15_485_863;
    let shifted: Vec<i32> = value.iter().map(|v| v + LARGE_PRIME).collect();
    timeout(Duration::from_secs(10), channel.put_async(shifted))
        .await
        .unwrap()
        .unwrap();

    let value = timeout(Duration::from_secs(10), channel.get())
        .await
        .unwrap()
        .unwrap();
    for (i, element) in value.iter().enumerate() {
        assert_eq!(*element, i as i32 + LARGE_PRIME);
    }

    context.close().await;
    server.stop().await;
}

#[tokio::test]
async fn graphic_enum_labels_and_alarm() {
    init_logging();
    let server = MockServer::start(standard_pvs()).await;
    let context = test_context(&server).await;

    let channel = context.create_channel::<i16>("enum").unwrap();
    timeout(CONNECT_DEADLINE, channel.connect())
        .await
        .unwrap()
        .unwrap();

    channel.put_async(2).await.unwrap();
    assert_eq!(channel.get().await.unwrap(), 2);

    let graphic = channel.get_meta(DbrCategory::Graphics).await.unwrap();
    assert_eq!(graphic.value(), &DbrValue::Enum(vec![2]));
    let expected: Vec<String> = ["zero", "one", "two", "three", "four", "five", "six", "seven"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(graphic.labels(), Some(expected.as_slice()));
    let alarm = graphic.status().unwrap();
    assert_eq!(alarm.status, AlarmStatus::Udf);
    assert_eq!(alarm.severity, AlarmSeverity::Invalid);

    context.close().await;
    server.stop().await;
}

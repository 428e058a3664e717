// Copyright (c) 2022-2023 The MobileCoin Foundation

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tokio::sync::broadcast;

use hwlink::{
    calls::{GetEntropy, GetFeatures, Initialize, Ping},
    config::EmulatorOptions,
    proto::{Fields, SchemaSet},
    transport::EmulatorTransport,
    CallOptions, ErrorCode, Session, SessionEvent, TransportKind,
};

mod helpers;
use helpers::*;

const DEVICE: &str = "emulator-1";

fn fields(v: serde_json::Value) -> Fields {
    v.as_object().cloned().unwrap()
}

fn manual() -> EmulatorOptions {
    EmulatorOptions {
        manual_confirm: true,
        ..Default::default()
    }
}

/// Receive events until one matches, or time out
async fn await_event(
    rx: &mut broadcast::Receiver<SessionEvent>,
    f: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let e = rx.recv().await.expect("Event channel closed");
            if f(&e) {
                return e;
            }
        }
    })
    .await
    .expect("Timeout waiting for event")
}

#[tokio::test]
async fn acquire_and_release() {
    let (s, _e) = setup(EmulatorOptions {
        devices: 2,
        ..Default::default()
    });
    let mut events = s.subscribe();

    let devices = s.enumerate().await.unwrap();
    assert_eq!(devices.len(), 2);

    let h = s.acquire(DEVICE).await.unwrap();
    assert_eq!(h.kind, TransportKind::Emulator);

    match await_event(&mut events, |_| true).await {
        SessionEvent::DeviceConnect(d) => assert_eq!(d, h),
        other => panic!("unexpected event: {other:?}"),
    }

    // Repeated acquisition returns the existing handle
    assert_eq!(s.acquire(DEVICE).await.unwrap(), h);

    // Distinct devices get distinct connect ids
    let h2 = s.acquire("emulator-2").await.unwrap();
    assert_ne!(h.connect_id, h2.connect_id);
    assert_eq!(s.devices().len(), 2);

    s.release(DEVICE).await.unwrap();
    s.release(DEVICE).await.unwrap();

    let e = s
        .call(DEVICE, "GetFeatures", Fields::new(), CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(e.code, ErrorCode::TransportNotFound);

    s.release_all().await.unwrap();
    assert!(s.devices().is_empty());

    let e = s.acquire("emulator-3").await.unwrap_err();
    assert_eq!(e.code, ErrorCode::DeviceNotFound);
}

#[tokio::test]
async fn call_requires_configuration() {
    setup_logging();

    let e = Arc::new(EmulatorTransport::new(&EmulatorOptions::default()).unwrap());
    let s = Session::with_transport(e.clone()).unwrap();

    s.acquire(DEVICE).await.unwrap();

    let r = s
        .call(DEVICE, "Ping", Fields::new(), CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(r.code, ErrorCode::TransportNotConfigured);

    // Nothing was written
    assert_eq!(e.writes(), 0);

    s.configure_default().unwrap();
    assert_eq!(
        s.configure_default().unwrap_err().code,
        ErrorCode::RuntimeError
    );

    assert!(s
        .call(DEVICE, "Ping", Fields::new(), CallOptions::default())
        .await
        .is_ok());
}

#[tokio::test]
async fn typed_calls() {
    let (s, _e) = setup(EmulatorOptions::default());
    s.acquire(DEVICE).await.unwrap();
    let mut events = s.subscribe();

    let f = s
        .typed_call(DEVICE, &Initialize::default())
        .await
        .unwrap();
    assert_eq!(f.vendor.as_deref(), Some("hwlink"));
    assert!(f.session_id.is_some());

    // Session resumes when the id matches
    let f2 = s
        .typed_call(
            DEVICE,
            &Initialize {
                session_id: f.session_id.clone(),
            },
        )
        .await
        .unwrap();
    assert_eq!(f2.session_id, f.session_id);

    let f3 = s.typed_call(DEVICE, &GetFeatures {}).await.unwrap();
    assert_eq!(f3.version(), f.version());

    let r = s
        .typed_call(
            DEVICE,
            &Ping {
                message: Some("hello".to_string()),
                button_protection: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(r.message.as_deref(), Some("hello"));

    // Entropy requires confirmation, acknowledged automatically
    let r = s
        .typed_call(DEVICE, &GetEntropy { size: 32 })
        .await
        .unwrap();
    assert_eq!(r.bytes().unwrap().len(), 32);

    let evt = await_event(&mut events, |e| {
        matches!(e, SessionEvent::ButtonRequest { .. })
    })
    .await;
    assert_eq!(
        evt,
        SessionEvent::ButtonRequest {
            id: DEVICE.to_string(),
            code: Some("ButtonRequest_ProtectCall".to_string()),
        }
    );
}

#[tokio::test]
async fn typed_call_requires_schema() {
    setup_logging();

    let e = Arc::new(EmulatorTransport::new(&EmulatorOptions::default()).unwrap());
    let s = Session::with_transport(e).unwrap();

    let schemas = SchemaSet::from_json(
        r#"{ "nested": {
            "Ping": { "fields": { "message": { "type": "string", "id": 1 } } },
            "Success": { "fields": { "message": { "type": "string", "id": 1 } } },
            "MessageType": { "values": { "MessageType_Ping": 1, "MessageType_Success": 2 } }
        } }"#,
    )
    .unwrap();
    s.configure_schemas(schemas).unwrap();
    s.acquire(DEVICE).await.unwrap();

    let r = s.typed_call(DEVICE, &GetFeatures {}).await.unwrap_err();
    assert_eq!(r.code, ErrorCode::SchemaNotFound);

    let r = s
        .call(DEVICE, "GetFeatures", Fields::new(), CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(r.code, ErrorCode::SchemaNotFound);
}

#[tokio::test]
async fn device_failures() {
    let (s, _e) = setup(EmulatorOptions::default());
    s.acquire(DEVICE).await.unwrap();

    let r = s
        .call(
            DEVICE,
            "GetEntropy",
            fields(json!({ "size": 4096 })),
            CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(r.code, ErrorCode::DeviceFailure);

    // Unsolicited acknowledgement
    let r = s
        .call(DEVICE, "ButtonAck", Fields::new(), CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(r.code, ErrorCode::DeviceFailure);

    // Slot is released after failures
    assert_eq!(s.in_flight(), None);
}

#[tokio::test]
async fn multi_frame_call() {
    let (s, e) = setup(EmulatorOptions::default());
    s.acquire(DEVICE).await.unwrap();

    let message = "x".repeat(200);

    let r = s
        .call(
            DEVICE,
            "Ping",
            fields(json!({ "message": message })),
            CallOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(r.name, "Success");
    assert_eq!(r.fields["message"], json!(message));

    // 212 byte message over 64 byte frames
    assert_eq!(e.writes(), 4);
}

#[tokio::test]
async fn single_flight() {
    let (s, e) = setup(manual());
    let s = Arc::new(s);
    s.acquire(DEVICE).await.unwrap();

    let s1 = s.clone();
    let pending = tokio::spawn(async move {
        s1.typed_call(
            DEVICE,
            &Ping {
                message: Some("held".to_string()),
                button_protection: Some(true),
            },
        )
        .await
    });

    await_in_flight(&s, "ButtonAck").await;

    // Concurrent calls are rejected without disturbing the pending call
    let r = s
        .call(DEVICE, "GetFeatures", Fields::new(), CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(r.code, ErrorCode::TransportCallInProgress);
    assert_eq!(s.in_flight().map(|f| f.name), Some("ButtonAck".to_string()));

    e.press_button(DEVICE).unwrap();

    let r = pending.await.unwrap().unwrap();
    assert_eq!(r.message.as_deref(), Some("held"));
    assert_eq!(s.in_flight(), None);
}

#[tokio::test]
async fn cancel_preempts_pending_call() {
    let (s, _e) = setup(manual());
    let s = Arc::new(s);
    s.acquire(DEVICE).await.unwrap();

    let s1 = s.clone();
    let pending = tokio::spawn(async move {
        s1.typed_call(
            DEVICE,
            &Ping {
                message: None,
                button_protection: Some(true),
            },
        )
        .await
    });

    await_in_flight(&s, "ButtonAck").await;

    s.cancel(DEVICE).await.unwrap();

    let r = pending.await.unwrap().unwrap_err();
    assert_eq!(r.code, ErrorCode::BleForceCleanRunPromise);
    assert_eq!(s.in_flight(), None);

    // Device remains usable
    assert!(s.typed_call(DEVICE, &GetFeatures {}).await.is_ok());
}

#[tokio::test]
async fn forced_call_preempts() {
    let (s, _e) = setup(manual());
    let s = Arc::new(s);
    s.acquire(DEVICE).await.unwrap();

    let s1 = s.clone();
    let pending = tokio::spawn(async move {
        s1.typed_call(
            DEVICE,
            &Ping {
                message: None,
                button_protection: Some(true),
            },
        )
        .await
    });

    await_in_flight(&s, "ButtonAck").await;

    let r = s
        .call(DEVICE, "GetFeatures", Fields::new(), CallOptions::forced())
        .await
        .unwrap();
    assert_eq!(r.name, "Features");

    let r = pending.await.unwrap().unwrap_err();
    assert_eq!(r.code, ErrorCode::BleForceCleanRunPromise);
}

#[tokio::test]
async fn disconnect_cleanup() {
    let (s, e) = setup(manual());
    let s = Arc::new(s);
    let mut events = s.subscribe();

    let h = s.acquire(DEVICE).await.unwrap();

    let s1 = s.clone();
    let pending = tokio::spawn(async move {
        s1.typed_call(
            DEVICE,
            &Ping {
                message: None,
                button_protection: Some(true),
            },
        )
        .await
    });

    await_in_flight(&s, "ButtonAck").await;

    e.disconnect(DEVICE).unwrap();

    let r = pending.await.unwrap().unwrap_err();
    assert_eq!(r.code, ErrorCode::DeviceDisconnected);

    let evt = await_event(&mut events, |e| {
        matches!(e, SessionEvent::DeviceDisconnect(_))
    })
    .await;
    assert_eq!(evt, SessionEvent::DeviceDisconnect(h.clone()));

    assert_eq!(s.in_flight(), None);
    assert!(s.devices().is_empty());

    let r = s
        .call(DEVICE, "GetFeatures", Fields::new(), CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(r.code, ErrorCode::TransportNotFound);

    // Re-acquisition after the device returns
    e.reconnect(DEVICE).unwrap();
    let h2 = s.acquire(DEVICE).await.unwrap();
    assert_ne!(h2.connect_id, h.connect_id);
    assert!(s.typed_call(DEVICE, &GetFeatures {}).await.is_ok());
}

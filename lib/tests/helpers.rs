// Copyright (c) 2022-2023 The MobileCoin Foundation

use std::{str::FromStr, sync::Arc, time::Duration};

use log::LevelFilter;
use simplelog::SimpleLogger;

use hwlink::{config::EmulatorOptions, transport::EmulatorTransport, Session};

/// Setup logging, level configurable via `LOG_LEVEL`
pub fn setup_logging() {
    let log_level = match std::env::var("LOG_LEVEL").map(|v| LevelFilter::from_str(&v)) {
        Ok(Ok(l)) => l,
        _ => LevelFilter::Debug,
    };

    let log_cfg = simplelog::ConfigBuilder::new()
        .add_filter_ignore_str("hyper")
        .add_filter_ignore_str("reqwest")
        .build();

    let _ = SimpleLogger::init(log_level, log_cfg);
}

/// Setup a configured session over an emulator transport
pub fn setup(opts: EmulatorOptions) -> (Session, Arc<EmulatorTransport>) {
    setup_logging();

    let e = Arc::new(EmulatorTransport::new(&opts).expect("Failed to create emulator"));

    let s = Session::with_transport(e.clone()).expect("Failed to open session");
    s.configure_default().expect("Failed to configure schemas");

    (s, e)
}

/// Poll until the session reports `name` in flight
#[allow(unused)]
pub async fn await_in_flight(s: &Session, name: &str) {
    for _ in 0..100 {
        if s.in_flight().map(|f| f.name) == Some(name.to_string()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("Timeout waiting for {name} to be in flight");
}

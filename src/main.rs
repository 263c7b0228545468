//! Process entry point: wires the PC/SC-backed driver into the Session
//! Facade, then serves the HTTP bridge described in spec §6. Mirrors the
//! original prototype's `cmd/main.go` — establish the hardware context,
//! build the handler table, listen — but as two independent halves
//! (`watcher::PcscDriver::start`, `http::routes`) joined only by the
//! `Facade` and the presence broadcast channel.

use std::sync::Arc;

use warp::Filter;

use ntag_kiosk_bridge::http;
use ntag_kiosk_bridge::session::Facade;
use ntag_kiosk_bridge::watcher::PcscDriver;

const LISTEN_PORT: u16 = 7070;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (events_tx, _events_rx) = tokio::sync::broadcast::channel(64);

    let driver = PcscDriver::start(events_tx.clone()).expect("failed to establish PC/SC context");
    let facade = Arc::new(Facade::new(driver));

    let routes = http::routes(facade, events_tx).with(warp::log("ntag_kiosk_bridge::http"));

    log::info!("listening on 0.0.0.0:{}", LISTEN_PORT);
    warp::serve(routes).run(([0, 0, 0, 0], LISTEN_PORT)).await;
}

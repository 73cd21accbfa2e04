//! Live feed client for the explorer WebSocket.
//!
//! Owns one long-lived connection: subscribes to the mempool feed, tracks
//! every monitored vault address, forwards parsed JSON frames downstream,
//! and keeps the link alive with ping/pong. A connection that goes quiet
//! past the pong deadline is torn down and re-established with bounded
//! exponential backoff; the backoff resets on every successful connect.

use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
    time::Duration,
};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::{
    sync::mpsc,
    time::{interval, sleep, Instant},
};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::{config::Config, error::ExplorerError};

/// Set of addresses the feed should watch. Written by startup/admin tasks,
/// read (copy-on-read) by the WebSocket reader on every reconnect.
pub type MonitoredAddresses = Arc<RwLock<HashSet<String>>>;

pub struct WsClient {
    url: String,
    ping_interval: Duration,
    ping_timeout: Duration,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
}

impl WsClient {
    pub fn new(config: &Config) -> Self {
        WsClient {
            url: config.mempool_ws.clone(),
            ping_interval: config.ws_ping_interval,
            ping_timeout: config.ws_ping_timeout,
            reconnect_delay: config.ws_reconnect_delay,
            max_reconnect_delay: config.ws_max_reconnect_delay,
        }
    }

    /// Connect-and-listen loop. Runs until cancelled or until the frame
    /// channel closes; every parsed inbound frame is forwarded to
    /// `frames`. `track_rx` delivers addresses to start tracking on the
    /// live connection; the full monitored set is re-sent after each
    /// reconnect.
    pub async fn run(
        &self,
        monitored: MonitoredAddresses,
        mut track_rx: mpsc::Receiver<String>,
        frames: mpsc::Sender<Value>,
        cancel: CancellationToken,
    ) {
        let mut delay = self.reconnect_delay;
        while !cancel.is_cancelled() && !frames.is_closed() {
            match connect_async(&self.url).await {
                Ok((mut ws, _)) => {
                    info!(url = %self.url, "websocket connected");
                    delay = self.reconnect_delay;
                    let outcome = async {
                        self.subscribe(&mut ws, &monitored).await?;
                        self.session(&mut ws, &mut track_rx, &frames, &cancel).await
                    }
                    .await;
                    match outcome {
                        Ok(()) => return, // cancelled or downstream gone
                        Err(e) => warn!(error = %e, "websocket session ended"),
                    }
                }
                Err(e) => warn!(error = %e, url = %self.url, "websocket connect failed"),
            }

            debug!(?delay, "websocket reconnecting after backoff");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(delay) => {}
            }
            delay = (delay * 2).min(self.max_reconnect_delay);
        }
    }

    /// Requests the live feeds and re-tracks every monitored address.
    async fn subscribe<S>(
        &self,
        ws: &mut S,
        monitored: &MonitoredAddresses,
    ) -> Result<(), ExplorerError>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        send_json(ws, &json!({"action": "want", "data": ["blocks", "mempool-blocks"]})).await?;

        let addresses: Vec<String> = monitored
            .read()
            .expect("monitored set lock poisoned")
            .iter()
            .cloned()
            .collect();
        if !addresses.is_empty() {
            info!(count = addresses.len(), "re-tracking monitored addresses");
        }
        for address in addresses {
            send_json(ws, &json!({"track-address": address})).await?;
        }
        Ok(())
    }

    /// One connected session: pumps inbound frames, sends pings, and
    /// declares the connection dead when nothing (not even a pong) arrives
    /// within the pong deadline.
    async fn session<S>(
        &self,
        ws: &mut S,
        track_rx: &mut mpsc::Receiver<String>,
        frames: &mpsc::Sender<Value>,
        cancel: &CancellationToken,
    ) -> Result<(), ExplorerError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Unpin,
    {
        let mut ping_tick = interval(self.ping_interval);
        ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws.send(Message::Close(None)).await;
                    return Ok(());
                }
                Some(address) = track_rx.recv() => {
                    debug!(%address, "tracking new address on live connection");
                    send_json(ws, &json!({"track-address": address})).await?;
                }
                _ = ping_tick.tick() => {
                    if last_inbound.elapsed() > self.ping_interval + self.ping_timeout {
                        return Err(ExplorerError::Ws("no pong within timeout".into()));
                    }
                    ws.send(Message::Ping(Vec::new().into()))
                        .await
                        .map_err(|e| ExplorerError::Ws(e.to_string()))?;
                }
                inbound = ws.next() => {
                    match inbound {
                        Some(Ok(message)) => {
                            last_inbound = Instant::now();
                            match message {
                                Message::Text(text) => {
                                    match serde_json::from_str::<Value>(text.as_str()) {
                                        Ok(frame) => {
                                            if frames.send(frame).await.is_err() {
                                                return Ok(());
                                            }
                                        }
                                        Err(_) => {
                                            warn!("failed to parse websocket frame as JSON");
                                        }
                                    }
                                }
                                // Pings are answered by the transport;
                                // pongs only refresh liveness.
                                Message::Ping(_) | Message::Pong(_) => {}
                                Message::Close(reason) => {
                                    return Err(ExplorerError::Ws(format!(
                                        "closed by peer: {reason:?}"
                                    )));
                                }
                                Message::Binary(_) | Message::Frame(_) => {}
                            }
                        }
                        Some(Err(e)) => return Err(ExplorerError::Ws(e.to_string())),
                        None => return Err(ExplorerError::Ws("stream ended".into())),
                    }
                }
            }
        }
    }
}

async fn send_json<S>(ws: &mut S, payload: &Value) -> Result<(), ExplorerError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    ws.send(Message::Text(payload.to_string().into()))
        .await
        .map_err(|e| ExplorerError::Ws(e.to_string()))
}

mod handle_websocket;
mod subscription;

use crate::comms::{ToMinionMessage, ToMinionPayload, ToOverlordMessage};
use crate::db::DbRelay;
use crate::error::Error;
use crate::globals::GLOBALS;
use crate::{RunState, USER_AGENT};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use http::Uri;
use nostr_types::{Id, RelayUrl, Unixtime};
use std::collections::HashSet;
use std::time::Duration;
use subscription::Subscription;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::broadcast::Receiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch::Receiver as WatchReceiver;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tungstenite::protocol::{Message as WsMessage, WebSocketConfig};

/// One websocket session to one relay. The overlord spawns one of
/// these per active relay and supervises the task.
pub struct Minion {
    url: RelayUrl,
    to_overlord: UnboundedSender<ToOverlordMessage>,
    from_overlord: Receiver<ToMinionMessage>,
    dbrelay: DbRelay,
    stream: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    subscription: Option<Subscription>,
    postings: HashSet<Id>,
    read_runstate: WatchReceiver<RunState>,
    exiting: bool,
}

impl Minion {
    pub async fn new(url: RelayUrl) -> Result<Minion, Error> {
        let to_overlord = GLOBALS.to_overlord.clone();
        let from_overlord = GLOBALS.to_minions.subscribe();
        let dbrelay = match DbRelay::fetch_one(url.as_str()).await? {
            Some(dbrelay) => dbrelay,
            None => {
                let dbrelay = DbRelay::new(url.as_str())?;
                DbRelay::upsert(dbrelay.clone()).await?;
                dbrelay
            }
        };

        Ok(Minion {
            url,
            to_overlord,
            from_overlord,
            dbrelay,
            stream: None,
            subscription: None,
            postings: HashSet::new(),
            read_runstate: GLOBALS.read_runstate.clone(),
            exiting: false,
        })
    }
}

impl Minion {
    pub async fn handle(&mut self, mut messages: Vec<ToMinionPayload>) -> Result<(), Error> {
        tracing::trace!("{}: Minion handling started", &self.url);

        // Connect to the relay
        let websocket_stream = {
            let uri: http::Uri = self.url.as_str().parse::<Uri>()?;
            let host = uri.host().ok_or(Error::UrlHasNoHostname)?.to_owned();

            let key: [u8; 16] = rand::random();
            let req = http::request::Request::builder()
                .method("GET")
                .header("User-Agent", USER_AGENT)
                .header("Host", host)
                .header("Connection", "Upgrade")
                .header("Upgrade", "websocket")
                .header("Sec-WebSocket-Version", "13")
                .header(
                    "Sec-WebSocket-Key",
                    base64::engine::general_purpose::STANDARD.encode(key),
                )
                .uri(uri)
                .body(())?;

            let config: WebSocketConfig = WebSocketConfig {
                max_message_size: Some(1024 * 1024 * 16),
                max_frame_size: Some(1024 * 1024 * 16),
                accept_unmasked_frames: false,
                ..Default::default()
            };

            let connect_future = tokio::time::timeout(
                Duration::new(15, 0),
                tokio_tungstenite::connect_async_with_config(req, Some(config), false),
            );

            let websocket_stream;
            tokio::select! {
                _ = self.read_runstate.wait_for(|runstate| !runstate.going_online()) => {
                    return Ok(());
                },
                connect_result = connect_future => {
                    (websocket_stream, _) = connect_result??;
                },
            }

            tracing::debug!("{}: Connected", &self.url);
            websocket_stream
        };

        self.stream = Some(websocket_stream);

        // Bump the success count for the relay
        let now = Unixtime::now()?.0;
        DbRelay::update_success(self.dbrelay.url.clone(), now).await?;

        // Handle initial messages (normally the current subscription)
        for message in messages.drain(..) {
            self.handle_overlord_message(message).await?;
        }

        // Tell the overlord we are ready to receive commands
        self.to_overlord
            .send(ToOverlordMessage::MinionIsReady(self.url.clone()))?;

        // Ping timer
        let mut ping_timer = tokio::time::interval(Duration::new(55, 0));
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.tick().await; // use up the first immediate tick

        'relayloop: loop {
            match self.loop_handler(&mut ping_timer).await {
                Ok(_) => {
                    if self.exiting {
                        break 'relayloop;
                    }
                }
                Err(e) => {
                    if let Error::Websocket(_) = e {
                        return Err(e);
                    }
                    // Log them and keep going
                    tracing::warn!("{}: {}", &self.url, e);
                }
            }
        }

        // Close the connection politely
        let ws_stream = self.stream.as_mut().unwrap();
        if let Err(e) = ws_stream.send(WsMessage::Close(None)).await {
            tracing::debug!("{}: websocket close error: {}", &self.url, e);
        }

        tracing::debug!("Minion for {} shutting down", &self.url);
        Ok(())
    }

    async fn loop_handler(
        &mut self,
        ping_timer: &mut tokio::time::Interval,
    ) -> Result<(), Error> {
        let ws_stream = self.stream.as_mut().unwrap();

        select! {
            _ = ping_timer.tick() => {
                ws_stream.send(WsMessage::Ping(vec![])).await?;
            },
            _ = self.read_runstate.changed() => {
                if !self.read_runstate.borrow().going_online() {
                    self.exiting = true;
                }
            },
            ws_message = ws_stream.next() => {
                let ws_message = match ws_message {
                    Some(m) => m,
                    None => {
                        // probably connection reset
                        self.exiting = true;
                        return Ok(());
                    }
                }?;

                match ws_message {
                    WsMessage::Text(t) => {
                        self.handle_nostr_message(t).await?;
                    },
                    WsMessage::Binary(_) => tracing::warn!("{}: Unexpected binary message", &self.url),
                    WsMessage::Ping(x) => ws_stream.send(WsMessage::Pong(x)).await?,
                    WsMessage::Pong(_) => { }, // we just ignore pongs
                    WsMessage::Close(_) => self.exiting = true,
                    WsMessage::Frame(_) => tracing::warn!("{}: Unexpected frame message", &self.url),
                }
            },
            to_minion_message = self.from_overlord.recv() => {
                let to_minion_message = match to_minion_message {
                    Ok(m) => m,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        self.exiting = true;
                        return Ok(());
                    },
                    Err(e) => return Err(e.into()),
                };
                if to_minion_message.target == self.url.as_str()
                    || to_minion_message.target == "all"
                {
                    self.handle_overlord_message(to_minion_message.payload).await?;
                }
            },
        }

        Ok(())
    }

    async fn handle_overlord_message(&mut self, payload: ToMinionPayload) -> Result<(), Error> {
        match payload {
            ToMinionPayload::Subscribe(filters, generation) => {
                self.subscribe(filters, generation).await?;
            }
            ToMinionPayload::Unsubscribe => {
                self.unsubscribe().await?;
            }
            ToMinionPayload::PostEvent(event) => {
                // Only relays we write to get our events
                if self.dbrelay.write {
                    let id = event.id;
                    let msg = nostr_types::ClientMessage::Event(event);
                    let wire = serde_json::to_string(&msg)?;
                    let ws_stream = self.stream.as_mut().unwrap();
                    ws_stream.send(WsMessage::Text(wire)).await?;
                    self.postings.insert(id);
                    tracing::debug!("{}: Posted event {}", &self.url, id.as_hex_string());
                }
            }
            ToMinionPayload::Shutdown => {
                tracing::debug!("{}: Websocket listener shutting down", &self.url);
                self.exiting = true;
            }
        }
        Ok(())
    }

    async fn subscribe(&mut self, filters: Vec<nostr_types::Filter>, generation: u64) -> Result<(), Error> {
        // Close any prior main subscription first
        if let Some(sub) = &self.subscription {
            let wire = serde_json::to_string(&sub.close_message())?;
            let ws_stream = self.stream.as_mut().unwrap();
            ws_stream.send(WsMessage::Text(wire)).await?;
        }

        let sub = Subscription::new("main", generation, filters);
        let wire = serde_json::to_string(&sub.req_message())?;
        let ws_stream = self.stream.as_mut().unwrap();
        ws_stream.send(WsMessage::Text(wire.clone())).await?;
        tracing::trace!("{}: Sent {}", &self.url, &wire);
        self.subscription = Some(sub);

        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<(), Error> {
        if let Some(sub) = self.subscription.take() {
            let wire = serde_json::to_string(&sub.close_message())?;
            let ws_stream = self.stream.as_mut().unwrap();
            ws_stream.send(WsMessage::Text(wire)).await?;
        }
        Ok(())
    }
}

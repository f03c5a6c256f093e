use crate::commands::{self, Command};
use crate::comms::{ToMinionMessage, ToMinionPayload, ToOverlordMessage};
use crate::db::{DbFollow, DbQueuedEvent, DbRelay, DbSetting, FollowSource, Queue};
use crate::egress;
use crate::error::Error;
use crate::follows;
use crate::globals::{Globals, GLOBALS};
use crate::minion::Minion;
use crate::pool;
use crate::settings::Settings;
use crate::status;
use crate::subscriptions::SubscriptionManager;
use crate::RunState;
use nostr_types::{RelayUrl, Unixtime};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast::Sender;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::{select, task};

/// The service façade. Owns lifecycle, the relay pool, all timers and
/// the status broadcast; every mutating command funnels through its
/// inbox so state changes stay single-writer.
pub struct Overlord {
    to_minions: Sender<ToMinionMessage>,
    inbox: UnboundedReceiver<ToOverlordMessage>,

    // All the minion tasks running.
    minions: task::JoinSet<Result<(), Error>>,

    // Map from minion task::Id to Url
    minions_task_url: HashMap<task::Id, RelayUrl>,

    sm: SubscriptionManager,

    // Consecutive reconnect failures per relay, for backoff
    reconnect_failures: HashMap<RelayUrl, u32>,

    // Relays that reported EOSE for the current subscription
    eose_relays: HashSet<RelayUrl>,
}

impl Overlord {
    pub fn new(inbox: UnboundedReceiver<ToOverlordMessage>) -> Overlord {
        let to_minions = GLOBALS.to_minions.clone();
        Overlord {
            to_minions,
            inbox,
            minions: task::JoinSet::new(),
            minions_task_url: HashMap::new(),
            sm: SubscriptionManager::new(),
            reconnect_failures: HashMap::new(),
            eose_relays: HashSet::new(),
        }
    }

    pub async fn run(&mut self) {
        if let Err(e) = self.run_inner().await {
            tracing::error!("{}", e);
        }

        GLOBALS.running.store(false, Ordering::Relaxed);
        let _ = GLOBALS.write_runstate.send(RunState::ShuttingDown);

        tracing::debug!("Overlord signalling minions to shutdown");
        let _ = self.to_minions.send(ToMinionMessage {
            target: "all".to_string(),
            payload: ToMinionPayload::Shutdown,
        });

        // Give in-flight work a grace period, then abort what remains
        let grace = GLOBALS.settings.read().shutdown_grace_ms;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(grace);
        while !self.minions.is_empty() {
            select! {
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("Aborting {} unresponsive minion(s)", self.minions.len());
                    self.minions.abort_all();
                },
                task_nextjoined = self.minions.join_next_with_id() => {
                    self.handle_task_nextjoined(task_nextjoined).await;
                }
            }
        }

        tracing::info!("Overlord confirms all minions have shutdown");
    }

    pub async fn run_inner(&mut self) -> Result<(), Error> {
        // Load settings
        let settings = Settings::load().await?;
        *GLOBALS.settings.write() = settings.clone();

        // Restore the configured mode
        let mode_online = match DbSetting::fetch_setting_string("mode").await? {
            Some(mode) => mode != "offline",
            None => true,
        };
        GLOBALS.mode_online.store(mode_online, Ordering::Relaxed);

        DbRelay::ensure_defaults().await?;

        // Demote outgoing rows stranded in-flight by a previous run
        egress::recover_in_flight().await?;

        GLOBALS.running.store(true, Ordering::Relaxed);
        status::refresh_queue_stats().await?;

        if mode_online {
            self.go_online().await?;
        } else {
            let _ = GLOBALS.write_runstate.send(RunState::Offline);
        }

        status::broadcast_status().await;

        let mut status_timer =
            tokio::time::interval(Duration::from_millis(settings.status_interval_ms));
        status_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        status_timer.tick().await; // use up the first immediate tick

        let mut queue_timer =
            tokio::time::interval(Duration::from_millis(settings.queue_interval_ms));
        queue_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        queue_timer.tick().await;

        let mut flush_timer =
            tokio::time::interval(Duration::from_millis(settings.outgoing_flush_interval_ms));
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        flush_timer.tick().await;

        let mut refresh_timer =
            tokio::time::interval(Duration::from_millis(settings.subscription_refresh_ms));
        refresh_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        refresh_timer.tick().await;

        'mainloop: loop {
            select! {
                _ = status_timer.tick() => {
                    if !GLOBALS.background.load(Ordering::Relaxed) {
                        status::broadcast_status().await;
                    }
                },
                _ = queue_timer.tick() => {
                    if !GLOBALS.background.load(Ordering::Relaxed) {
                        if let Err(e) = status::refresh_queue_stats().await {
                            tracing::warn!("{}", e);
                        }
                        pool::prune_seen(3600);
                        if let Err(e) = DbQueuedEvent::retention_sweep(Unixtime::now()?.0).await {
                            tracing::warn!("{}", e);
                        }
                    }
                },
                _ = flush_timer.tick() => {
                    if GLOBALS.read_runstate.borrow().going_online() {
                        Overlord::spawn_flush();
                    }
                },
                _ = refresh_timer.tick() => {
                    if GLOBALS.read_runstate.borrow().going_online() {
                        // Guards against silent subscription drops
                        match self.sm.refresh(false).await {
                            Ok(true) => { self.eose_relays.clear(); },
                            Ok(false) => (),
                            Err(e) => tracing::warn!("{}", e),
                        }
                    }
                },
                task_nextjoined = self.minions.join_next_with_id(), if !self.minions.is_empty() => {
                    self.handle_task_nextjoined(task_nextjoined).await;
                },
                message = self.inbox.recv() => {
                    let message = match message {
                        Some(message) => message,
                        None => break 'mainloop,
                    };
                    match self.handle_message(message).await {
                        Ok(keepgoing) => {
                            if !keepgoing {
                                break 'mainloop;
                            }
                        }
                        Err(e) => {
                            // Log them and keep looping
                            tracing::error!("{}", e);
                        }
                    }
                },
            }
        }

        Ok(())
    }

    fn spawn_flush() {
        tokio::spawn(async {
            if let Err(e) = egress::flush_outgoing().await {
                tracing::warn!("Outgoing flush failed: {}", e);
            }
        });
    }

    async fn handle_message(&mut self, message: ToOverlordMessage) -> Result<bool, Error> {
        match message {
            ToOverlordMessage::Command(job) => {
                let (reply, keep_going) = self.handle_command(job.cmd).await;
                let _ = job.reply.send(reply);
                return Ok(keep_going);
            }
            ToOverlordMessage::FlushOutgoing => {
                if GLOBALS.read_runstate.borrow().going_online() {
                    Overlord::spawn_flush();
                }
            }
            ToOverlordMessage::MinionActivity(url) => {
                self.reconnect_failures.remove(&url);
            }
            ToOverlordMessage::MinionIsReady(url) => {
                tracing::debug!("{}: ready", &url);
                GLOBALS.connected_relays.insert(url.clone(), ());
                self.reconnect_failures.remove(&url);
                // Anything that queued while we were disconnected
                Overlord::spawn_flush();
            }
            ToOverlordMessage::ReconnectRelay(url) => {
                if GLOBALS.read_runstate.borrow().going_online()
                    && !self.minions_task_url.values().any(|u| *u == url)
                {
                    let active = DbRelay::select_active().await?;
                    if active.contains(&url) {
                        self.engage_minion(url).await?;
                    }
                }
            }
            ToOverlordMessage::SubscriptionEose(url, handle) => {
                self.eose_relays.insert(url);
                let all_reported = !GLOBALS.connected_relays.is_empty()
                    && GLOBALS
                        .connected_relays
                        .iter()
                        .all(|entry| self.eose_relays.contains(entry.key()));
                if all_reported {
                    tracing::info!(
                        "All connected relays report end of stored events on '{}'",
                        handle
                    );
                    Globals::note("Caught up with stored events");
                }
            }
            ToOverlordMessage::Shutdown => {
                tracing::info!("Overlord shutting down");
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn handle_command(&mut self, cmd: Command) -> (Value, bool) {
        let mut keep_going = true;

        let result: Result<Value, Error> = match cmd {
            Command::Start => self.cmd_start().await,
            Command::Shutdown { keep_background } => {
                if keep_background {
                    GLOBALS.background.store(true, Ordering::Relaxed);
                    Globals::note("Running in background: status timers stopped");
                    tracing::info!("Shutdown requested with keepBackground; network side stays up");
                    Ok(json!({"success": true, "background": true}))
                } else {
                    keep_going = false;
                    Ok(json!({"success": true}))
                }
            }
            Command::SetMode { mode } => self.cmd_set_mode(mode).await,
            Command::AddRelay {
                url,
                label,
                categories,
                priority,
                read,
                write,
                auth_required,
            } => {
                self.cmd_add_relay(url, label, categories, priority, read, write, auth_required)
                    .await
            }
            Command::UpdateRelay { url, patch } => {
                self.cmd_update_relay(url, patch).await
            }
            Command::RemoveRelay { url, force } => self.cmd_remove_relay(url, force).await,
            Command::SetCategoryPreference { categories } => {
                self.cmd_set_category_preference(categories).await
            }
            Command::SetFollows { pubkeys } => self.cmd_set_follows(pubkeys).await,
            Command::AddFollow { pubkey, label } => self.cmd_add_follow(pubkey, label).await,
            Command::RemoveFollow { pubkey } => self.cmd_remove_follow(pubkey).await,
            Command::SetLimits { limits } => self.cmd_set_limits(limits).await,
            Command::PublishEvent {
                event,
                routing,
                keep_for,
            } => self.cmd_publish_event(event, routing, keep_for).await,
            // Read commands normally answer in the IPC layer, but stay
            // servable here too
            other => match commands::read_reply(&other).await {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Ok(json!({"success": false, "error": "unhandled command"})),
                Err(e) => Err(e),
            },
        };

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Command failed: {}", e);
                json!({"success": false, "error": e.to_string()})
            }
        };

        (value, keep_going)
    }

    async fn cmd_start(&mut self) -> Result<Value, Error> {
        GLOBALS.running.store(true, Ordering::Relaxed);
        GLOBALS.background.store(false, Ordering::Relaxed);
        if GLOBALS.mode_online.load(Ordering::Relaxed) {
            self.go_online().await?;
        }
        status::broadcast_status().await;
        Ok(json!({"success": true}))
    }

    async fn cmd_set_mode(&mut self, mode: String) -> Result<Value, Error> {
        let online = match mode.as_str() {
            "online" => true,
            "offline" => false,
            _ => return Err(Error::UnknownMode(mode)),
        };

        DbSetting::update_string("mode", mode.clone()).await?;
        GLOBALS.mode_online.store(online, Ordering::Relaxed);
        GLOBALS
            .last_mode_change
            .store(status::now_ms(), Ordering::Relaxed);

        if online {
            self.go_online().await?;
        } else {
            self.go_offline().await?;
        }

        status::broadcast_status().await;
        Ok(json!({"success": true, "mode": mode}))
    }

    #[allow(clippy::too_many_arguments)]
    async fn cmd_add_relay(
        &mut self,
        url: String,
        label: Option<String>,
        categories: Option<Vec<String>>,
        priority: Option<i64>,
        read: Option<bool>,
        write: Option<bool>,
        auth_required: Option<bool>,
    ) -> Result<Value, Error> {
        let mut relay = match DbRelay::fetch_one(&url).await? {
            Some(existing) => existing,
            None => DbRelay::new(&url)?,
        };
        if let Some(label) = label {
            relay.label = Some(label);
        }
        if let Some(mut categories) = categories {
            categories.sort();
            categories.dedup();
            relay.categories = categories;
        }
        if let Some(priority) = priority {
            relay.priority = priority;
        }
        if let Some(read) = read {
            relay.read = read;
        }
        if let Some(write) = write {
            relay.write = write;
        }
        if let Some(auth_required) = auth_required {
            relay.auth_required = auth_required;
        }
        let url = relay.url.clone();
        DbRelay::upsert(relay).await?;

        self.reconcile_relays().await?;
        status::broadcast_status().await;
        Ok(json!({"success": true, "url": url}))
    }

    async fn cmd_update_relay(
        &mut self,
        url: String,
        patch: crate::db::RelayPatch,
    ) -> Result<Value, Error> {
        DbRelay::update(&url, patch).await?;
        self.reconcile_relays().await?;
        status::broadcast_status().await;
        Ok(json!({"success": true}))
    }

    async fn cmd_remove_relay(&mut self, url: String, force: bool) -> Result<Value, Error> {
        DbRelay::remove(&url, force).await?;
        self.reconcile_relays().await?;
        status::broadcast_status().await;
        Ok(json!({"success": true}))
    }

    async fn cmd_set_category_preference(
        &mut self,
        categories: Vec<String>,
    ) -> Result<Value, Error> {
        DbRelay::set_category_preference(categories).await?;
        self.reconcile_relays().await?;
        status::broadcast_status().await;
        Ok(json!({"success": true}))
    }

    async fn cmd_set_follows(&mut self, pubkeys: Vec<String>) -> Result<Value, Error> {
        let mut entries: Vec<DbFollow> = Vec::new();
        for input in pubkeys.iter() {
            entries.push(DbFollow {
                pubkey: follows::normalize_pubkey(input)?,
                source: FollowSource::Manual,
                label: None,
            });
        }
        DbFollow::replace_source(FollowSource::Manual, entries).await?;
        self.refresh_subscription().await?;
        status::broadcast_status().await;
        Ok(json!({"success": true}))
    }

    async fn cmd_add_follow(
        &mut self,
        pubkey: String,
        label: Option<String>,
    ) -> Result<Value, Error> {
        let normalized = follows::normalize_pubkey(&pubkey)?;
        DbFollow::upsert(DbFollow {
            pubkey: normalized.clone(),
            source: FollowSource::Manual,
            label,
        })
        .await?;
        self.refresh_subscription().await?;
        status::broadcast_status().await;
        Ok(json!({"success": true, "pubkey": normalized}))
    }

    async fn cmd_remove_follow(&mut self, pubkey: String) -> Result<Value, Error> {
        let normalized = follows::normalize_pubkey(&pubkey)?;
        DbFollow::remove(normalized, FollowSource::Manual).await?;
        self.refresh_subscription().await?;
        status::broadcast_status().await;
        Ok(json!({"success": true}))
    }

    async fn cmd_set_limits(
        &mut self,
        limits: crate::settings::ResourceLimits,
    ) -> Result<Value, Error> {
        let settings = {
            let mut settings = GLOBALS.settings.write();
            settings.limits = limits;
            settings.clone()
        };
        settings.save().await?;
        status::broadcast_status().await;
        Ok(json!({"success": true, "limits": settings.limits}))
    }

    async fn cmd_publish_event(
        &mut self,
        event: Value,
        routing: Option<commands::Routing>,
        keep_for: Option<i64>,
    ) -> Result<Value, Error> {
        let (id, row) = commands::prepare_outgoing_event(event, keep_for, routing)?;
        DbQueuedEvent::enqueue(Queue::CacheOut, row).await?;
        status::refresh_queue_stats().await?;

        // Nudge the flush; the command itself never waits on relays
        if GLOBALS.read_runstate.borrow().going_online() {
            Overlord::spawn_flush();
        }

        Ok(json!({"success": true, "eventId": id}))
    }

    async fn refresh_subscription(&mut self) -> Result<(), Error> {
        if self.sm.refresh(true).await? {
            self.eose_relays.clear();
        }
        Ok(())
    }

    async fn go_online(&mut self) -> Result<(), Error> {
        let _ = GLOBALS.write_runstate.send(RunState::Online);
        self.refresh_subscription().await?;
        self.reconcile_relays().await?;
        Ok(())
    }

    async fn go_offline(&mut self) -> Result<(), Error> {
        let _ = GLOBALS.write_runstate.send(RunState::Offline);
        self.sm.close();
        let _ = self.to_minions.send(ToMinionMessage {
            target: "all".to_string(),
            payload: ToMinionPayload::Shutdown,
        });
        // Synchronously observable: no connected relays, no armed throttle
        GLOBALS.connected_relays.clear();
        GLOBALS.outgoing_throttle_until.store(0, Ordering::Relaxed);
        self.eose_relays.clear();
        Ok(())
    }

    /// Bring the running minion set in line with the selected relays
    async fn reconcile_relays(&mut self) -> Result<(), Error> {
        if !GLOBALS.read_runstate.borrow().going_online() {
            return Ok(());
        }

        let active = DbRelay::select_active().await?;

        let engaged: Vec<RelayUrl> = self.minions_task_url.values().cloned().collect();
        for url in engaged.iter() {
            if !active.contains(url) {
                tracing::info!("Dropping relay {}", url);
                let _ = self.to_minions.send(ToMinionMessage {
                    target: url.as_str().to_owned(),
                    payload: ToMinionPayload::Shutdown,
                });
            }
        }

        for url in active.iter() {
            if !self.minions_task_url.values().any(|u| u == url) {
                self.engage_minion(url.clone()).await?;
            }
        }

        Ok(())
    }

    async fn engage_minion(&mut self, url: RelayUrl) -> Result<(), Error> {
        let mut messages: Vec<ToMinionPayload> = Vec::new();
        if let Some(payload) = self.sm.current_subscribe_payload() {
            messages.push(payload);
        }

        tracing::debug!("Engaging minion for {}", &url);
        let moved_url = url.clone();
        let abort_handle = self.minions.spawn(async move {
            let mut minion = Minion::new(moved_url).await?;
            minion.handle(messages).await
        });
        let id = abort_handle.id();
        self.minions_task_url.insert(id, url);

        Ok(())
    }

    async fn handle_task_nextjoined(
        &mut self,
        task_nextjoined: Option<Result<(task::Id, Result<(), Error>), task::JoinError>>,
    ) {
        let (id, failed) = match task_nextjoined {
            None => return,
            Some(Err(join_error)) => {
                tracing::error!("Minion task failed: {}", join_error);
                (join_error.id(), true)
            }
            Some(Ok((id, Err(e)))) => {
                tracing::warn!("Minion exited with error: {}", e);
                (id, true)
            }
            Some(Ok((id, Ok(())))) => (id, false),
        };

        let url = match self.minions_task_url.remove(&id) {
            Some(url) => url,
            None => return,
        };
        GLOBALS.connected_relays.remove(&url);

        if failed {
            let now = Unixtime::now().unwrap().0;
            if let Err(e) = DbRelay::update_failure(url.as_str().to_owned(), now).await {
                tracing::warn!("{}", e);
            }
        }

        if !GLOBALS.read_runstate.borrow().going_online() {
            return;
        }

        // Reconnect with exponential backoff and full jitter, as long
        // as the relay is still part of the selected set
        let still_active = match DbRelay::select_active().await {
            Ok(active) => active.contains(&url),
            Err(e) => {
                tracing::warn!("{}", e);
                false
            }
        };
        if !still_active {
            return;
        }

        let failures = self.reconnect_failures.entry(url.clone()).or_insert(0);
        *failures += 1;
        let ceiling = (2.0_f64 * (2.0_f64).powi((*failures - 1).min(10) as i32)).min(60.0);
        let delay = rand::random::<f64>() * ceiling;
        tracing::info!("Will reconnect to {} in {:.1}s", &url, delay);

        let moved_url = url;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            let _ = GLOBALS
                .to_overlord
                .send(ToOverlordMessage::ReconnectRelay(moved_url));
        });
    }
}

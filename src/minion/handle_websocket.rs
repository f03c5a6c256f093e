use super::Minion;
use crate::comms::ToOverlordMessage;
use crate::db::DbRelay;
use crate::error::Error;
use crate::pool::{self, RelayPublishResult};
use crate::process;
use nostr_types::{RelayMessage, Unixtime};

impl Minion {
    pub(super) async fn handle_nostr_message(&mut self, ws_message: String) -> Result<(), Error> {
        let relay_message: RelayMessage = serde_json::from_str(&ws_message)?;

        match relay_message {
            RelayMessage::Event(subid, event) => {
                // Any delivered event counts as liveness and resets the
                // relay's reconnect backoff
                self.to_overlord
                    .send(ToOverlordMessage::MinionActivity(self.url.clone()))?;

                // Structural and signature validation. Invalid events
                // are counted and dropped, never stored.
                if !process::verify_event(&event) {
                    return Ok(());
                }

                // Each id reaches ingress at most once per subscription,
                // no matter how many relays deliver it
                if !pool::note_seen(event.id) {
                    tracing::trace!(
                        "{}: {}: duplicate event {}",
                        &self.url,
                        subid.0,
                        event.id.as_hex_string()
                    );
                    return Ok(());
                }

                process::process_new_event(&event, Some(&self.url)).await?;
            }
            RelayMessage::Notice(msg) => {
                tracing::info!("{}: NOTICE: {}", &self.url, msg);
            }
            RelayMessage::Eose(subid) => {
                let matches = self
                    .subscription
                    .as_ref()
                    .map(|sub| sub.get_id() == subid.0)
                    .unwrap_or(false);
                if matches {
                    if let Some(sub) = self.subscription.as_mut() {
                        sub.set_eose();
                    }
                    self.to_overlord.send(ToOverlordMessage::SubscriptionEose(
                        self.url.clone(),
                        subid.0.clone(),
                    ))?;
                    tracing::trace!("{}: EOSE on {}", &self.url, subid.0);
                } else {
                    tracing::debug!("{}: EOSE for unknown subscription {:?}", &self.url, subid);
                }
            }
            RelayMessage::Ok(id, ok, ok_message) => {
                if self.postings.remove(&id) {
                    let now = Unixtime::now()?.0;
                    if ok {
                        pool::record_publish(id, self.url.as_str(), RelayPublishResult::Accepted);
                        DbRelay::update_success(self.url.as_str().to_owned(), now).await?;
                    } else {
                        pool::record_publish(
                            id,
                            self.url.as_str(),
                            RelayPublishResult::Rejected(ok_message.clone()),
                        );
                        DbRelay::update_failure(self.url.as_str().to_owned(), now).await?;
                    }
                }

                match ok {
                    true => tracing::debug!(
                        "{}: OK={} id={} message=\"{}\"",
                        &self.url,
                        ok,
                        id.as_hex_string(),
                        ok_message
                    ),
                    false => tracing::warn!(
                        "{}: OK={} id={} message=\"{}\"",
                        &self.url,
                        ok,
                        id.as_hex_string(),
                        ok_message
                    ),
                }
            }
            RelayMessage::Auth(_challenge) => {
                // Signing lives outside this runtime, so we cannot AUTH.
                tracing::warn!(
                    "{}: relay requested AUTH which this runtime cannot provide",
                    &self.url
                );
            }
            RelayMessage::Closed(subid, message) => {
                tracing::warn!("{}: CLOSED {}: {}", &self.url, subid.0, message);
                let matches = self
                    .subscription
                    .as_ref()
                    .map(|sub| sub.get_id() == subid.0)
                    .unwrap_or(false);
                if matches {
                    // The next refresh will resubscribe
                    self.subscription = None;
                }
            }
            _ => {
                tracing::warn!("{}: Unhandled relay message: {}", &self.url, ws_message);
            }
        }

        Ok(())
    }
}

use crate::comms::{CommandJob, ToOverlordMessage};
use crate::db::{DbFollow, DbQueuedEvent, DbRelay, FollowSource, Queue, RelayPatch};
use crate::error::Error;
use crate::globals::GLOBALS;
use crate::settings::ResourceLimits;
use crate::status;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::oneshot;

/// Routing metadata non-core consumers use to correlate an event with
/// application records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    pub table_name: Option<String>,
    pub record_uuid: Option<String>,
    pub user_profile_uuid: Option<String>,
}

/// The full command surface consumed over the local IPC
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    Start,
    Shutdown {
        #[serde(default)]
        keep_background: bool,
    },
    SetMode {
        mode: String,
    },
    GetStatusSnapshot,
    ListRelays {
        category: Option<String>,
    },
    AddRelay {
        url: String,
        label: Option<String>,
        categories: Option<Vec<String>>,
        priority: Option<i64>,
        read: Option<bool>,
        write: Option<bool>,
        auth_required: Option<bool>,
    },
    UpdateRelay {
        url: String,
        patch: RelayPatch,
    },
    RemoveRelay {
        url: String,
        #[serde(default)]
        force: bool,
    },
    GetCategoryPreference,
    SetCategoryPreference {
        categories: Vec<String>,
    },
    GetFollows,
    SetFollows {
        pubkeys: Vec<String>,
    },
    AddFollow {
        pubkey: String,
        label: Option<String>,
    },
    RemoveFollow {
        pubkey: String,
    },
    GetLimits,
    SetLimits {
        limits: ResourceLimits,
    },
    PublishEvent {
        event: Value,
        routing: Option<Routing>,
        keep_for: Option<i64>,
    },
    GetQueueSnapshot {
        limit: Option<usize>,
    },
}

/// Handle one JSON command and produce the JSON reply. Nothing escapes
/// this boundary: every failure becomes `{success:false, error}`.
pub async fn handle_command(json_text: &str) -> String {
    let reply = match dispatch(json_text).await {
        Ok(value) => value,
        Err(e) => json!({"success": false, "error": e.to_string()}),
    };
    reply.to_string()
}

async fn dispatch(json_text: &str) -> Result<Value, Error> {
    let cmd: Command = serde_json::from_str(json_text)?;

    // Read commands answer directly from a consistent snapshot of the
    // store; everything mutating is serialized through the overlord.
    match read_reply(&cmd).await? {
        Some(value) => Ok(value),
        None => send_to_overlord(cmd).await,
    }
}

/// Answer a read-only command, or None if the command mutates state
/// and must go through the overlord.
pub(crate) async fn read_reply(cmd: &Command) -> Result<Option<Value>, Error> {
    let value = match cmd {
        Command::GetStatusSnapshot => {
            let mut snapshot = status::build_snapshot().await?;
            snapshot["success"] = json!(true);
            Some(snapshot)
        }
        Command::ListRelays { category } => {
            let relays = DbRelay::fetch(category.clone()).await?;
            Some(json!({"success": true, "relays": relays}))
        }
        Command::GetCategoryPreference => {
            let categories = DbRelay::get_category_preference().await?;
            Some(json!({"success": true, "categories": categories}))
        }
        Command::GetFollows => {
            let follows = DbFollow::fetch(Some(FollowSource::Manual)).await?;
            Some(json!({"success": true, "follows": follows}))
        }
        Command::GetLimits => {
            let limits = GLOBALS.settings.read().limits.clone();
            Some(json!({"success": true, "limits": limits}))
        }
        Command::GetQueueSnapshot { limit } => {
            let limit = limit.unwrap_or(25);
            let mut queues = serde_json::Map::new();
            for queue in [Queue::CacheIn, Queue::CacheOut, Queue::StoreIn, Queue::StoreOut] {
                let page = DbQueuedEvent::fetch_page(queue, None, limit).await?;
                queues.insert(queue.as_str().to_owned(), serde_json::to_value(page)?);
            }
            Some(json!({
                "success": true,
                "queues": Value::Object(queues),
                "stats": GLOBALS.queue_stats.read().clone(),
            }))
        }
        _ => None,
    };

    Ok(value)
}

async fn send_to_overlord(cmd: Command) -> Result<Value, Error> {
    let (tx, rx) = oneshot::channel();
    GLOBALS
        .to_overlord
        .send(ToOverlordMessage::Command(CommandJob { cmd, reply: tx }))?;

    match tokio::time::timeout(Duration::from_secs(30), rx).await? {
        Ok(value) => Ok(value),
        Err(_) => Ok(json!({"success": false, "error": "command was dropped"})),
    }
}

/// The canonical serialization an event id is the hash of
fn canonical_event_json(event: &Value) -> Result<String, Error> {
    let pubkey = event
        .get("pubkey")
        .and_then(|v| v.as_str())
        .ok_or::<Error>("event is missing pubkey".into())?;
    let created_at = event
        .get("created_at")
        .and_then(|v| v.as_i64())
        .ok_or::<Error>("event is missing created_at".into())?;
    let kind = event
        .get("kind")
        .and_then(|v| v.as_u64())
        .ok_or::<Error>("event is missing kind".into())?;
    let tags = event.get("tags").cloned().unwrap_or_else(|| json!([]));
    let content = event.get("content").and_then(|v| v.as_str()).unwrap_or("");

    Ok(serde_json::to_string(&json!([
        0, pubkey, created_at, kind, tags, content
    ]))?)
}

pub fn compute_event_id(event: &Value) -> Result<String, Error> {
    let canonical = canonical_event_json(event)?;
    let hash = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(hash))
}

/// Turn a publish request into a cache_out row. The event id is the
/// hash of the canonical serialization: computed when the caller left
/// it out, verified against it when supplied. The signature may be
/// absent; egress will terminally fail such rows.
pub fn prepare_outgoing_event(
    event: Value,
    keep_for: Option<i64>,
    routing: Option<Routing>,
) -> Result<(String, DbQueuedEvent), Error> {
    let mut event = event;

    let computed = compute_event_id(&event)?;
    let id = match event.get("id").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
        Some(id) => {
            if id.to_lowercase() != computed {
                return Err(Error::EventIdMismatch(id.to_owned(), computed));
            }
            computed
        }
        None => {
            event["id"] = json!(computed);
            computed
        }
    };

    let kind = event
        .get("kind")
        .and_then(|v| v.as_u64())
        .ok_or::<Error>("event is missing kind".into())? as u32;
    let pubkey = event
        .get("pubkey")
        .and_then(|v| v.as_str())
        .ok_or::<Error>("event is missing pubkey".into())?
        .to_lowercase();
    let created_at = event
        .get("created_at")
        .and_then(|v| v.as_i64())
        .ok_or::<Error>("event is missing created_at".into())?;
    let tags = event.get("tags").cloned().unwrap_or_else(|| json!([]));
    let content = event
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_owned();
    let sig = event
        .get("sig")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_owned();

    let routing = routing.unwrap_or_default();

    let row = DbQueuedEvent {
        id: id.clone(),
        kind,
        pubkey,
        created_at,
        tags: serde_json::to_string(&tags)?,
        content,
        sig,
        proc_status: 0,
        proc_at: None,
        keep_for,
        table_name: routing.table_name,
        record_uuid: routing.record_uuid,
        user_profile_uuid: routing.user_profile_uuid,
    };

    Ok((id, row))
}

#[cfg(test)]
mod test {
    use super::*;

    const PK_HEX: &str = "ee11a5dff40c19a555f41fe42b48f00e618c91225622ae37b6c2bb67b76c4e49";

    fn unsigned_event() -> Value {
        json!({
            "pubkey": PK_HEX,
            "created_at": 1_700_000_000,
            "kind": 31001,
            "tags": [["d", "anno-1"]],
            "content": "{\"gameid\":\"G\"}",
        })
    }

    #[test]
    fn test_event_id_is_deterministic() {
        let a = compute_event_id(&unsigned_event()).unwrap();
        let b = compute_event_id(&unsigned_event()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let mut changed = unsigned_event();
        changed["content"] = json!("something else");
        assert_ne!(compute_event_id(&changed).unwrap(), a);
    }

    #[test]
    fn test_prepare_accepts_a_consistent_id() {
        let mut event = unsigned_event();
        let id = compute_event_id(&event).unwrap();
        event["id"] = json!(id);
        event["sig"] = json!("00".repeat(64));

        let (got, row) = prepare_outgoing_event(event, Some(3600), None).unwrap();
        assert_eq!(got, id);
        assert_eq!(row.keep_for, Some(3600));
        assert_eq!(row.sig, "00".repeat(64));
    }

    #[test]
    fn test_prepare_rejects_a_fabricated_id() {
        let mut event = unsigned_event();
        event["id"] = json!("cd".repeat(32));

        assert!(matches!(
            prepare_outgoing_event(event, None, None),
            Err(Error::EventIdMismatch(_, _))
        ));
    }

    #[test]
    fn test_prepare_computes_missing_id() {
        let (id, row) = prepare_outgoing_event(unsigned_event(), None, None).unwrap();
        assert_eq!(id, compute_event_id(&unsigned_event()).unwrap());
        assert_eq!(row.id, id);
        assert_eq!(row.sig, ""); // unsigned; egress will fail it terminally
    }

    #[test]
    fn test_prepare_rejects_structurally_broken_events() {
        let mut event = unsigned_event();
        event.as_object_mut().unwrap().remove("pubkey");
        assert!(prepare_outgoing_event(event, None, None).is_err());
    }

    #[test]
    fn test_command_parses_from_wire_form() {
        let cmd: Command =
            serde_json::from_str(r#"{"cmd":"setMode","mode":"offline"}"#).unwrap();
        assert!(matches!(cmd, Command::SetMode { ref mode } if mode == "offline"));

        let cmd: Command = serde_json::from_str(
            r#"{"cmd":"removeRelay","url":"wss://relay.example/","force":true}"#,
        )
        .unwrap();
        assert!(matches!(cmd, Command::RemoveRelay { force: true, .. }));

        let cmd: Command = serde_json::from_str(r#"{"cmd":"getStatusSnapshot"}"#).unwrap();
        assert!(matches!(cmd, Command::GetStatusSnapshot));
    }
}

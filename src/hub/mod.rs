//! Reconciliation hub
//!
//! Keeps one `/devicestatus`-shaped snapshot per device. REST responses
//! replace it wholesale, WebSocket phase events patch the status pair.

use std::sync::Mutex;

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::models::{DeviceSnapshot, Phase, PhaseEvent, STATUS_SLOT};

pub struct EventHub {
    device_id: String,
    snapshot: Mutex<Value>,
}

impl EventHub {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            snapshot: Mutex::new(normalize(&Value::Null)),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let doc = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        DeviceSnapshot::from_normalized(doc.clone())
    }

    /// Replace the snapshot with a REST status document.
    ///
    /// Never fails: malformed input falls back to Closed / 0%.
    pub fn seed_from_status(&self, raw: &Value) -> DeviceSnapshot {
        let normalized = normalize(raw);
        let mut doc = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        *doc = normalized;
        tracing::debug!(
            "[Hub] Device {} seeded: {}",
            self.device_id,
            doc["States"][STATUS_SLOT]["Data"]
        );
        DeviceSnapshot::from_normalized(doc.clone())
    }

    /// Patch the status pair with a push event.
    ///
    /// Returns `None` when the phase code is unknown; every other event counts
    /// as a change, even when the pair is identical.
    pub fn apply_event(&self, phase: i64, percent: Option<i64>) -> Option<DeviceSnapshot> {
        let Some(known) = Phase::from_code(phase) else {
            tracing::debug!("[Hub] Ignoring unknown phase {} for device {}", phase, self.device_id);
            return None;
        };

        let mut doc = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        let [_, previous_pos] = read_pair(&doc).unwrap_or([Phase::CLOSED, 0]);

        let percent = percent.or(match known {
            Phase::Open => Some(100),
            Phase::Closed => Some(0),
            _ => None,
        });
        let pos = percent.map(clamp_percent).unwrap_or(previous_pos);

        ensure_shape(&mut doc);
        doc["States"][STATUS_SLOT]["Data"] = json!([phase, pos]);
        doc["LastSeen"] = json!(Utc::now().to_rfc3339());

        Some(DeviceSnapshot::from_normalized(doc.clone()))
    }

    pub fn apply(&self, event: PhaseEvent) -> Option<DeviceSnapshot> {
        self.apply_event(event.phase, event.percent)
    }
}

fn clamp_percent(pos: i64) -> i64 {
    pos.clamp(0, 100)
}

/// Copy `raw` into a document whose `States[2].Data` is `[phase, percent]`
fn normalize(raw: &Value) -> Value {
    let mut doc = match raw {
        Value::Object(map) => Value::Object(map.clone()),
        _ => Value::Object(Map::new()),
    };

    let pair = read_pair(&doc);
    if pair.is_none() && !raw.is_null() {
        tracing::debug!("[Hub] Status payload missing [phase, percent], using defaults");
    }
    let [phase, pos] = pair.unwrap_or([Phase::CLOSED, 0]);

    ensure_shape(&mut doc);
    doc["States"][STATUS_SLOT]["Data"] = json!([phase, clamp_percent(pos)]);
    doc
}

/// Make sure `States` has at least three slots and slot 2 is an object
fn ensure_shape(doc: &mut Value) {
    if !doc["States"].is_array() {
        doc["States"] = json!([]);
    }
    if let Some(states) = doc["States"].as_array_mut() {
        while states.len() <= STATUS_SLOT {
            states.push(json!({}));
        }
        if !states[STATUS_SLOT].is_object() {
            states[STATUS_SLOT] = json!({});
        }
    }
}

fn read_pair(doc: &Value) -> Option<[i64; 2]> {
    let data = doc.get("States")?.get(STATUS_SLOT)?.get("Data")?.as_array()?;
    let phase = as_int(data.first()?)?;
    let pos = as_int(data.get(1)?)?;
    Some([phase, pos])
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok()
        }
        _ => None,
    }
}

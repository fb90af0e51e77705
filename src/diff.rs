use serde_json::{Map, Value};

use crate::types::{Device, Event};

pub(crate) fn diff_json(
    previous: &Value,
    current: &Value,
    path_prefix: &str,
    changes: &mut Vec<(String, Value, Value)>,
) {
    match (previous, current) {
        (Value::Object(prev_map), Value::Object(curr_map)) => {
            for (key, curr_val) in curr_map {
                let path = if path_prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{path_prefix}.{key}")
                };
                match prev_map.get(key) {
                    Some(prev_val) => diff_json(prev_val, curr_val, &path, changes),
                    None => {
                        if curr_val.is_object() {
                            diff_json(&Value::Object(Map::new()), curr_val, &path, changes);
                        } else {
                            changes.push((path, Value::Null, curr_val.clone()));
                        }
                    }
                }
            }
        }
        (prev, curr) if prev != curr => {
            changes.push((path_prefix.to_string(), prev.clone(), curr.clone()));
        }
        _ => {}
    }
}

/// Events describing how `current` differs from `previous` for one device.
/// Only the visible state and the online flag are reported; other payload
/// churn (timestamps, firmware) is ignored.
pub(crate) fn device_events(previous: &Device, current: &Device) -> Vec<Event> {
    let mut events = Vec::new();

    let old_state = previous.current_state();
    let new_state = current.current_state();
    if old_state != new_state {
        events.push(Event::DeviceStateChanged {
            device_id: current.id.clone(),
            old: old_state.map(str::to_owned),
            new: new_state.map(str::to_owned),
        });
    }

    let mut changes = Vec::new();
    diff_json(
        &Value::Object(previous.state.clone()),
        &Value::Object(current.state.clone()),
        "",
        &mut changes,
    );
    for (path, _old, new_val) in &changes {
        if let Some(evt) = map_typed_event(&current.id, path, new_val) {
            events.push(evt);
        }
    }
    events
}

fn map_typed_event(device_id: &str, path: &str, new_value: &Value) -> Option<Event> {
    match path {
        "online" => Some(Event::DeviceOnlineChanged {
            device_id: device_id.to_string(),
            online: new_value.as_bool().unwrap_or(false),
        }),
        _ => None,
    }
}

//! Topic templates and MQTT filter validation
//!
//! Application topics may carry a `${deviceIdentity}` placeholder that the caller
//! substitutes before publishing. Broker subscriptions use MQTT wildcard filters,
//! which are validated here; dispatch patterns are regexes and live in `dispatch`.

/// Placeholder replaced with a device identifier in topic templates
pub const DEVICE_IDENTITY_PLACEHOLDER: &str = "${deviceIdentity}";

/// Topic a device command response is published on
pub const TOPIC_DATA_RESP: &str = "/api/v1/${deviceIdentity}/mqtt/dataResp";

/// Topic a device data subscription request is published on
pub const TOPIC_DATA_SUBSCRIBE: &str = "/api/v1/${deviceIdentity}/mqtt/dataSubscribe";

/// Replace every `${deviceIdentity}` in `template` with `device_id`
pub fn substitute_device_identity(template: &str, device_id: &str) -> String {
    template.replace(DEVICE_IDENTITY_PLACEHOLDER, device_id)
}

/// Validate an MQTT subscription filter
///
/// `+` must occupy a whole level and `#` must be the last level on its own.
pub fn validate_filter(filter: &str) -> Result<(), String> {
    if filter.is_empty() {
        return Err("topic filter must not be empty".to_string());
    }
    if filter.contains('\0') {
        return Err(format!("topic filter '{filter}' contains a NUL character"));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != last) {
            return Err(format!(
                "topic filter '{filter}': '#' must be the final level on its own"
            ));
        }
        if level.contains('+') && *level != "+" {
            return Err(format!(
                "topic filter '{filter}': '+' must occupy an entire level"
            ));
        }
    }
    Ok(())
}

/// Validate a concrete topic name used for publishing
pub fn validate_publish_topic(topic: &str) -> Result<(), String> {
    if topic.is_empty() {
        return Err("topic must not be empty".to_string());
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(format!("topic '{topic}' must not contain wildcards"));
    }
    if topic.contains(DEVICE_IDENTITY_PLACEHOLDER) {
        return Err(format!(
            "topic '{topic}' still contains the {DEVICE_IDENTITY_PLACEHOLDER} placeholder"
        ));
    }
    Ok(())
}

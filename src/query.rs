//! Command envelopes sent to devices
use serde_json::{json, Map, Value};

pub const SYSTEM: &str = "system";
pub const TIME: &str = "time";
pub const EMETER: &str = "emeter";

/// A nested mapping of command group to command to arguments.
///
/// ```
/// use kasa_recorder::query::DeviceQuery;
///
/// let query = DeviceQuery::new().command("system", "get_sysinfo");
/// assert_eq!(query.to_json(), r#"{"system":{"get_sysinfo":null}}"#);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceQuery {
    groups: Map<String, Value>,
}

impl DeviceQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sysinfo, device clock and realtime meter in one envelope.
    pub fn discovery() -> Self {
        Self::new()
            .command(SYSTEM, "get_sysinfo")
            .command(TIME, "get_time")
            .command(EMETER, "get_realtime")
    }

    pub fn sysinfo() -> Self {
        Self::new().command(SYSTEM, "get_sysinfo")
    }

    pub fn emeter_realtime() -> Self {
        Self::new().command(EMETER, "get_realtime")
    }

    pub fn command(self, group: &str, name: &str) -> Self {
        self.command_with_args(group, name, Value::Null)
    }

    pub fn command_with_args(mut self, group: &str, name: &str, args: Value) -> Self {
        let entry = self
            .groups
            .entry(group.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(commands) = entry {
            commands.insert(name.to_string(), args);
        }
        self
    }

    /// Scope every command in the envelope to one outlet of a multi-outlet
    /// device.
    pub fn for_child(mut self, child_id: &str) -> Self {
        self.groups
            .insert(String::from("context"), json!({ "child_ids": [child_id] }));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.groups.clone()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_query_has_three_groups() {
        let value: Value = serde_json::from_str(&DeviceQuery::discovery().to_json()).unwrap();
        assert_eq!(
            value,
            json!({
                "system": {"get_sysinfo": null},
                "time": {"get_time": null},
                "emeter": {"get_realtime": null}
            })
        );
    }

    #[test]
    fn commands_in_the_same_group_are_merged() {
        let query = DeviceQuery::new()
            .command(EMETER, "get_realtime")
            .command_with_args(EMETER, "get_daystat", json!({"year": 2023, "month": 5}));
        let value: Value = serde_json::from_str(&query.to_json()).unwrap();
        assert_eq!(value["emeter"]["get_daystat"]["month"], 5);
        assert!(value["emeter"]["get_realtime"].is_null());
    }

    #[test]
    fn child_scope_adds_context() {
        let query = DeviceQuery::sysinfo().for_child("80064A0C00");
        let value: Value = serde_json::from_str(&query.to_json()).unwrap();
        assert_eq!(value["context"]["child_ids"][0], "80064A0C00");
    }

    #[test]
    fn serialises_compactly() {
        assert!(!DeviceQuery::discovery().to_json().contains(' '));
        assert!(DeviceQuery::new().is_empty());
    }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

/// One entry of the runtime's event stream, as emitted by
/// `docker events --format '{{json .}}'`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: EventActor,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub time: i64,
    #[serde(rename = "timeNano", default)]
    pub time_nano: i64,
}

impl RuntimeEvent {
    pub fn container(action: &str, id: &str, name: &str) -> Self {
        Self {
            kind: "container".to_string(),
            action: action.to_string(),
            actor: EventActor {
                id: id.to_string(),
                attributes: HashMap::from([("name".to_string(), name.to_string())]),
            },
            scope: "local".to_string(),
            time: 0,
            time_nano: 0,
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }

    pub fn is_container(&self) -> bool {
        self.kind == "container"
    }

    pub fn container_name(&self) -> Option<&str> {
        self.actor.attributes.get("name").map(String::as_str)
    }
}

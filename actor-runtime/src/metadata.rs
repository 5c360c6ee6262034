//! Identity of the hosted actor instance.

use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorMetadata {
    pub actor_id: String,
    /// Base URL of the operator dashboard; the actor id is appended.
    pub debug_url_base: Option<String>,
}

impl ActorMetadata {
    pub fn new(actor_id: impl Into<String>, debug_url_base: Option<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            debug_url_base,
        }
    }

    pub fn debug_url(&self) -> Option<String> {
        self.debug_url_base
            .as_deref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), self.actor_id))
    }

    /// Metadata attached to masked internal errors so operators can find
    /// the instance without leaking the cause.
    pub fn debug_metadata(&self) -> Value {
        match self.debug_url() {
            Some(url) => json!({ "actorId": self.actor_id, "url": url }),
            None => json!({ "actorId": self.actor_id }),
        }
    }
}

impl Default for ActorMetadata {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_url_trims_trailing_slash() {
        let md = ActorMetadata::new("abc", Some("https://hub.example/actors/".to_string()));
        assert_eq!(md.debug_url().as_deref(), Some("https://hub.example/actors/abc"));
    }

    #[test]
    fn test_debug_metadata_without_base() {
        let md = ActorMetadata::new("abc", None);
        assert_eq!(md.debug_metadata(), json!({"actorId": "abc"}));
    }
}

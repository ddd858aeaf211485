//! Channel bookkeeping for the messaging fabric.
//!
//! Channels are named routing endpoints. The manager tracks subscriber ids
//! and message counters per channel and protects system channels from
//! deletion.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Categories of channels, used for routing and access control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Agent,
    Project,
    Workflow,
    Broadcast,
    System,
    Notifications,
}

/// A messaging channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub channel_type: ChannelType,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub subscribers: Vec<String>,
    #[serde(default)]
    pub message_count: u64,
}

impl Channel {
    fn new(name: impl Into<String>, channel_type: ChannelType, description: &str) -> Self {
        Self {
            name: name.into(),
            channel_type,
            description: description.to_string(),
            created_at: Utc::now(),
            subscribers: Vec::new(),
            message_count: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Manager for channel records. Owned by the broker; all access goes through
/// the broker's lock.
#[derive(Debug)]
pub struct ChannelManager {
    channels: HashMap<String, Channel>,
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelManager {
    /// Create the manager with the default system channels in place.
    pub fn new() -> Self {
        let mut channels = HashMap::new();
        for ch in [
            Channel::new(
                "system",
                ChannelType::System,
                "System-wide notifications and events",
            ),
            Channel::new("notifications", ChannelType::Notifications, "General notifications"),
            Channel::new("maestro", ChannelType::Agent, "Orchestrator inbox"),
        ] {
            channels.insert(ch.name.clone(), ch);
        }
        Self { channels }
    }

    /// Create a channel; returns false if the name is taken.
    pub fn create(&mut self, name: &str, channel_type: ChannelType, description: &str) -> bool {
        if self.channels.contains_key(name) {
            return false;
        }
        self.channels
            .insert(name.to_string(), Channel::new(name, channel_type, description));
        tracing::debug!(channel = name, "channel created");
        true
    }

    /// Ensure a channel exists, inferring its type from the name prefix.
    pub fn ensure(&mut self, name: &str) -> &mut Channel {
        if !self.channels.contains_key(name) {
            let channel_type = infer_channel_type(name);
            self.channels
                .insert(name.to_string(), Channel::new(name, channel_type, ""));
        }
        self.channels.get_mut(name).expect("channel just ensured")
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    /// Delete a channel. System channels cannot be deleted.
    pub fn delete(&mut self, name: &str) -> bool {
        match self.channels.get(name) {
            Some(ch) if ch.channel_type == ChannelType::System => {
                tracing::warn!(channel = name, "refusing to delete system channel");
                false
            }
            Some(_) => {
                self.channels.remove(name);
                true
            }
            None => false,
        }
    }

    pub fn add_subscriber(&mut self, name: &str, subscriber_id: &str) {
        let channel = self.ensure(name);
        if !channel.subscribers.iter().any(|s| s == subscriber_id) {
            channel.subscribers.push(subscriber_id.to_string());
        }
    }

    pub fn remove_subscriber(&mut self, name: &str, subscriber_id: &str) {
        if let Some(channel) = self.channels.get_mut(name) {
            channel.subscribers.retain(|s| s != subscriber_id);
        }
    }

    pub fn record_message(&mut self, name: &str) {
        self.ensure(name).message_count += 1;
    }

    pub fn list(&self) -> Vec<&Channel> {
        self.channels.values().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Agent inbox channel name for a given agent id.
pub fn agent_channel(agent_id: &str) -> String {
    format!("agent:{agent_id}")
}

/// Project-scoped channel name.
pub fn project_channel(project_id: &str) -> String {
    format!("project:{project_id}")
}

/// Workflow-scoped channel name.
pub fn workflow_channel(workflow_id: &str) -> String {
    format!("workflow:{workflow_id}")
}

fn infer_channel_type(name: &str) -> ChannelType {
    if name.starts_with("agent:") {
        ChannelType::Agent
    } else if name.starts_with("project:") {
        ChannelType::Project
    } else if name.starts_with("workflow:") {
        ChannelType::Workflow
    } else if name == "system" {
        ChannelType::System
    } else if name == "notifications" {
        ChannelType::Notifications
    } else {
        ChannelType::Broadcast
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_channels_exist() {
        let mgr = ChannelManager::new();
        assert!(mgr.get("system").is_some());
        assert!(mgr.get("notifications").is_some());
        assert!(mgr.get("maestro").is_some());
    }

    #[test]
    fn system_channel_cannot_be_deleted() {
        let mut mgr = ChannelManager::new();
        assert!(!mgr.delete("system"));
        assert!(mgr.get("system").is_some());

        mgr.create("scratch", ChannelType::Broadcast, "");
        assert!(mgr.delete("scratch"));
        assert!(mgr.get("scratch").is_none());
    }

    #[test]
    fn ensure_infers_type_from_prefix() {
        let mut mgr = ChannelManager::new();
        assert_eq!(mgr.ensure("agent:backend-1").channel_type, ChannelType::Agent);
        assert_eq!(mgr.ensure("project:p1").channel_type, ChannelType::Project);
        assert_eq!(mgr.ensure("workflow:w1").channel_type, ChannelType::Workflow);
        assert_eq!(mgr.ensure("anything").channel_type, ChannelType::Broadcast);
    }

    #[test]
    fn subscriber_list_deduplicates() {
        let mut mgr = ChannelManager::new();
        mgr.add_subscriber("room", "s1");
        mgr.add_subscriber("room", "s1");
        mgr.add_subscriber("room", "s2");
        assert_eq!(mgr.get("room").unwrap().subscriber_count(), 2);

        mgr.remove_subscriber("room", "s1");
        assert_eq!(mgr.get("room").unwrap().subscriber_count(), 1);
    }

    #[test]
    fn message_counter_increments() {
        let mut mgr = ChannelManager::new();
        mgr.record_message("room");
        mgr.record_message("room");
        assert_eq!(mgr.get("room").unwrap().message_count, 2);
    }
}

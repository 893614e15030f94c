//! Persisted record models
//!
//! Every record is stored as one pretty-printed JSON document at
//! `<storage_root>/<KIND>/<id>.json`. Unknown or missing fields fall back to
//! defaults so hand-edited files stay loadable.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum length of a record id in bytes.
pub const MAX_RECORD_ID_LEN: usize = 128;

/// Directory names of every record kind, in display order.
pub const RECORD_KINDS: [&str; 5] = [
    Agent::KIND,
    User::KIND,
    Location::KIND,
    Inventory::KIND,
    Gimmick::KIND,
];

/// A record persisted one-file-per-id.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Directory name under the storage root.
    const KIND: &'static str;

    fn id(&self) -> &str;

    /// Default-valued record for a freshly created id.
    fn with_id(id: &str) -> Self;

    /// Stamp the record as modified now.
    fn touch(&mut self);
}

/// Reject ids that are not a single, plain path component.
///
/// Ids become file names, so separators, `.`/`..`, leading dots (hidden and
/// temp files) and control characters are refused.
pub fn validate_record_id(id: &str) -> Result<&str> {
    let ok = !id.is_empty()
        && id.len() <= MAX_RECORD_ID_LEN
        && !id.starts_with('.')
        && !id
            .chars()
            .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control());
    if ok {
        Ok(id)
    } else {
        Err(Error::InvalidRecordId(id.to_string()))
    }
}

/// Resolve `kind` to its canonical directory name.
pub fn validate_kind(kind: &str) -> Result<&'static str> {
    RECORD_KINDS
        .iter()
        .copied()
        .find(|k| *k == kind)
        .ok_or_else(|| Error::UnknownKind(kind.to_string()))
}

// =============================================================================
// Agent
// =============================================================================

/// An autonomous agent living in the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub persona: String,
    /// Location the agent currently occupies, if any.
    pub location_id: Option<String>,
    /// Short free-form memory lines, oldest first.
    pub memories: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Agent {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: String::new(),
            persona: String::new(),
            location_id: None,
            memories: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for Agent {
    const KIND: &'static str = "agents";

    fn id(&self) -> &str {
        &self.id
    }

    fn with_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            ..Self::default()
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// User
// =============================================================================

/// A human participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub display_name: String,
    /// Agents this user has interacted with.
    pub agent_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for User {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            display_name: String::new(),
            agent_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for User {
    const KIND: &'static str = "users";

    fn id(&self) -> &str {
        &self.id
    }

    fn with_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: id.to_string(),
            ..Self::default()
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// Location
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Ids of agents currently present.
    pub occupants: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Location {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: String::new(),
            description: String::new(),
            occupants: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for Location {
    const KIND: &'static str = "locations";

    fn id(&self) -> &str {
        &self.id
    }

    fn with_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            ..Self::default()
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// Inventory
// =============================================================================

/// One stack of items inside an inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Item {
    pub id: String,
    pub name: String,
    pub quantity: u32,
    /// Arbitrary per-item attributes.
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// Items owned by an agent or user; the inventory id is the owner id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub id: String,
    pub items: Vec<Item>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self {
            id: String::new(),
            items: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

impl Inventory {
    /// Add `quantity` of an item, stacking onto an existing entry with the same id.
    pub fn add_item(&mut self, item_id: &str, name: &str, quantity: u32) {
        if let Some(existing) = self.items.iter_mut().find(|i| i.id == item_id) {
            existing.quantity = existing.quantity.saturating_add(quantity);
            return;
        }
        self.items.push(Item {
            id: item_id.to_string(),
            name: name.to_string(),
            quantity,
            attributes: serde_json::Map::new(),
        });
    }

    /// Remove up to `quantity` of an item; drops the entry when it reaches zero.
    /// Returns how many were actually removed.
    pub fn remove_item(&mut self, item_id: &str, quantity: u32) -> u32 {
        let Some(pos) = self.items.iter().position(|i| i.id == item_id) else {
            return 0;
        };
        let entry = &mut self.items[pos];
        let removed = entry.quantity.min(quantity);
        entry.quantity -= removed;
        if entry.quantity == 0 {
            self.items.remove(pos);
        }
        removed
    }

    #[must_use]
    pub fn quantity_of(&self, item_id: &str) -> u32 {
        self.items
            .iter()
            .find(|i| i.id == item_id)
            .map_or(0, |i| i.quantity)
    }
}

impl Record for Inventory {
    const KIND: &'static str = "inventories";

    fn id(&self) -> &str {
        &self.id
    }

    fn with_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// Gimmick
// =============================================================================

/// An interactive object placed in the world (door, lever, vending machine...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Gimmick {
    pub id: String,
    pub name: String,
    pub location_id: Option<String>,
    /// Gimmick-specific state blob.
    pub state: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl Default for Gimmick {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            location_id: None,
            state: serde_json::Value::Object(serde_json::Map::new()),
            updated_at: Utc::now(),
        }
    }
}

impl Record for Gimmick {
    const KIND: &'static str = "gimmicks";

    fn id(&self) -> &str {
        &self.id
    }

    fn with_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            ..Self::default()
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn validate_record_id_accepts_plain_names() {
        for id in ["alice", "agent-42", "Room_3", "café", "a.b"] {
            assert_eq!(validate_record_id(id).unwrap(), id);
        }
    }

    #[test]
    fn validate_record_id_rejects_paths_and_hidden_names() {
        let long = "x".repeat(MAX_RECORD_ID_LEN + 1);
        for id in ["", ".", "..", "../evil", "a/b", "a\\b", ".hidden", "c:x", "nul\0", &long] {
            assert!(
                matches!(validate_record_id(id), Err(Error::InvalidRecordId(_))),
                "{id:?} should be rejected"
            );
        }
    }

    #[test]
    fn with_id_sets_identity_fields() {
        let agent = Agent::with_id("bob");
        assert_eq!(agent.id(), "bob");
        assert_eq!(agent.name, "bob");
        assert!(agent.memories.is_empty());

        let gimmick = Gimmick::with_id("lever");
        assert!(gimmick.state.is_object());
    }

    #[test]
    fn touch_moves_updated_at_forward() {
        let mut user = User::with_id("u1");
        let before = user.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        user.touch();
        assert!(user.updated_at > before);
        assert_eq!(user.created_at, before);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let loc: Location = serde_json::from_str(r#"{"id":"plaza","name":"Plaza"}"#).unwrap();
        assert_eq!(loc.id, "plaza");
        assert!(loc.occupants.is_empty());
        assert!(loc.description.is_empty());
    }

    #[test]
    fn inventory_stacks_and_removes() {
        let mut inv = Inventory::with_id("alice");
        inv.add_item("apple", "Apple", 2);
        inv.add_item("apple", "Apple", 3);
        inv.add_item("key", "Key", 1);
        assert_eq!(inv.quantity_of("apple"), 5);
        assert_eq!(inv.items.len(), 2);

        assert_eq!(inv.remove_item("apple", 10), 5);
        assert_eq!(inv.quantity_of("apple"), 0);
        assert_eq!(inv.items.len(), 1);
        assert_eq!(inv.remove_item("missing", 1), 0);
    }

    #[test]
    fn validate_kind_knows_every_store() {
        assert_eq!(validate_kind("agents").unwrap(), Agent::KIND);
        assert_eq!(validate_kind("gimmicks").unwrap(), Gimmick::KIND);
        assert!(matches!(validate_kind("Agents"), Err(Error::UnknownKind(_))));
    }

    #[test]
    fn record_kinds_are_distinct() {
        let mut kinds = RECORD_KINDS.to_vec();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), RECORD_KINDS.len());
    }

    proptest! {
        #[test]
        fn agent_json_round_trip(
            name in "[a-zA-Z ]{0,24}",
            persona in ".{0,64}",
            memories in proptest::collection::vec(".{0,32}", 0..6),
            location in proptest::option::of("[a-z0-9-]{1,16}"),
        ) {
            let mut agent = Agent::with_id("prop-agent");
            agent.name = name;
            agent.persona = persona;
            agent.memories = memories;
            agent.location_id = location;

            let bytes = serde_json::to_vec_pretty(&agent).unwrap();
            let back: Agent = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(back, agent);
        }
    }
}

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCategory {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl CategoryDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: i64,
    pub name: String,
    pub category_id: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDraft {
    pub name: String,
    pub category_id: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl EntityDraft {
    pub fn new(name: impl Into<String>, category_id: i64) -> Self {
        Self {
            name: name.into(),
            category_id,
            ..Self::default()
        }
    }
}

/// Master data that diagram nodes can be bound to.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    categories: BTreeMap<i64, EntityCategory>,
    entities: BTreeMap<i64, Entity>,
    next_category_id: i64,
    next_entity_id: i64,
}

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern is a valid regex")
});

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn required_name(name: &str, what: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::validation(format!("{what} name must not be empty")));
    }
    Ok(name.to_string())
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn categories(&self) -> Vec<EntityCategory> {
        self.categories.values().cloned().collect()
    }

    pub fn category(&self, id: i64) -> Option<&EntityCategory> {
        self.categories.get(&id)
    }

    pub fn create_category(&mut self, draft: CategoryDraft) -> Result<EntityCategory> {
        let id = self.next_category_id.max(1);
        let category = self.checked_category(id, draft)?;
        self.insert_category(category.clone());
        Ok(category)
    }

    pub fn update_category(&mut self, id: i64, draft: CategoryDraft) -> Result<EntityCategory> {
        if !self.categories.contains_key(&id) {
            return Err(Error::not_found("category", id));
        }
        let category = self.checked_category(id, draft)?;
        self.categories.insert(id, category.clone());
        Ok(category)
    }

    /// Fails with [`Error::CategoryInUse`] while any entity references `id`.
    pub fn delete_category(&mut self, id: i64) -> Result<EntityCategory> {
        if !self.categories.contains_key(&id) {
            return Err(Error::not_found("category", id));
        }
        let entity_count = self.entities_in_category(id).len();
        if entity_count > 0 {
            return Err(Error::CategoryInUse { id, entity_count });
        }
        self.categories
            .remove(&id)
            .ok_or_else(|| Error::not_found("category", id))
    }

    /// Stores an already persisted category, keeping its id.
    pub fn insert_category(&mut self, category: EntityCategory) {
        self.next_category_id = self.next_category_id.max(category.id + 1);
        self.categories.insert(category.id, category);
    }

    fn checked_category(&self, id: i64, draft: CategoryDraft) -> Result<EntityCategory> {
        let name = required_name(&draft.name, "category")?;
        let clash = self
            .categories
            .values()
            .any(|other| other.id != id && other.name.eq_ignore_ascii_case(&name));
        if clash {
            return Err(Error::validation(format!(
                "a category named '{name}' already exists"
            )));
        }
        Ok(EntityCategory {
            id,
            name,
            description: clean(draft.description),
        })
    }

    /// Keeps category ids up to `last_id` from being handed out again.
    pub fn reserve_category_ids(&mut self, last_id: i64) {
        self.next_category_id = self.next_category_id.max(last_id + 1);
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.entities.values().cloned().collect()
    }

    pub fn entity(&self, id: i64) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn entities_in_category(&self, category_id: i64) -> Vec<&Entity> {
        self.entities
            .values()
            .filter(|entity| entity.category_id == category_id)
            .collect()
    }

    pub fn create_entity(&mut self, draft: EntityDraft) -> Result<Entity> {
        let id = self.next_entity_id.max(1);
        let entity = self.checked_entity(id, draft)?;
        self.insert_entity(entity.clone());
        Ok(entity)
    }

    pub fn update_entity(&mut self, id: i64, draft: EntityDraft) -> Result<Entity> {
        if !self.entities.contains_key(&id) {
            return Err(Error::not_found("entity", id));
        }
        let entity = self.checked_entity(id, draft)?;
        self.entities.insert(id, entity.clone());
        Ok(entity)
    }

    /// Unconditional; bindings to the entity resolve to "Unknown" afterwards.
    pub fn delete_entity(&mut self, id: i64) -> Result<Entity> {
        self.entities
            .remove(&id)
            .ok_or_else(|| Error::not_found("entity", id))
    }

    pub fn insert_entity(&mut self, entity: Entity) {
        self.next_entity_id = self.next_entity_id.max(entity.id + 1);
        self.entities.insert(entity.id, entity);
    }

    /// Keeps entity ids up to `last_id` from being handed out again, so a
    /// binding to a deleted entity never resolves to a newer one.
    pub fn reserve_entity_ids(&mut self, last_id: i64) {
        self.next_entity_id = self.next_entity_id.max(last_id + 1);
    }

    fn checked_entity(&self, id: i64, draft: EntityDraft) -> Result<Entity> {
        let name = required_name(&draft.name, "entity")?;
        if !self.categories.contains_key(&draft.category_id) {
            return Err(Error::validation(format!(
                "category {} does not exist",
                draft.category_id
            )));
        }

        let contact_email = clean(draft.contact_email);
        if let Some(email) = &contact_email {
            if !EMAIL_PATTERN.is_match(email) {
                return Err(Error::validation(format!(
                    "'{email}' is not a valid contact email"
                )));
            }
        }

        Ok(Entity {
            id,
            name,
            category_id: draft.category_id,
            description: clean(draft.description),
            contact_name: clean(draft.contact_name),
            contact_email,
            contact_phone: clean(draft.contact_phone),
            address: clean(draft.address),
        })
    }

    /// `"None"` for unbound (absent or 0), `"Unknown"` for a missing entity.
    pub fn entity_display_name(&self, id: Option<i64>) -> &str {
        match id {
            None | Some(0) => UNBOUND_LABEL,
            Some(id) => self
                .entities
                .get(&id)
                .map_or(UNKNOWN_LABEL, |entity| entity.name.as_str()),
        }
    }

    pub fn category_name(&self, id: i64) -> &str {
        self.categories
            .get(&id)
            .map_or(UNKNOWN_LABEL, |category| category.name.as_str())
    }
}

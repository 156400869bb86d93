use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the template, diagram and registry operations.
///
/// Graph parsing and layout never produce these; they degrade instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("category {id} is in use by {entity_count} {}", entity_noun(.entity_count))]
    CategoryInUse { id: i64, entity_count: usize },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("node '{node_id}' does not exist in diagram {diagram_id}")]
    NodeNotInDiagram { diagram_id: i64, node_id: String },
}

fn entity_noun(count: &usize) -> &'static str {
    if *count == 1 { "entity" } else { "entities" }
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_in_use_message_pluralises() {
        let one = Error::CategoryInUse { id: 3, entity_count: 1 };
        let many = Error::CategoryInUse { id: 3, entity_count: 4 };
        assert_eq!(one.to_string(), "category 3 is in use by 1 entity");
        assert_eq!(many.to_string(), "category 3 is in use by 4 entities");
    }
}

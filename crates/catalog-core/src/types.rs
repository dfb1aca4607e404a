use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CatalogError, Result};

// =============================================================================
// Enums
// =============================================================================

/// The closed set of catalog entity variants.
///
/// The Similarity Index is partitioned by this type: a business object is
/// never scored against a business rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// High-level business concept that groups data elements.
    BusinessObject,
    /// A concrete field or attribute of a business object.
    DataElement,
    /// A business or subject area.
    Domain,
    /// A constraint, calculation or validation applied to catalog data.
    BusinessRule,
}

impl EntityType {
    /// Every variant, in declaration order.
    pub const ALL: [EntityType; 4] = [
        EntityType::BusinessObject,
        EntityType::DataElement,
        EntityType::Domain,
        EntityType::BusinessRule,
    ];

    /// Stable storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::BusinessObject => "business_object",
            EntityType::DataElement => "data_element",
            EntityType::Domain => "domain",
            EntityType::BusinessRule => "business_rule",
        }
    }

    /// The documented attribute keys for this variant and their kinds.
    pub fn attribute_schema(&self) -> &'static [(&'static str, AttrKind)] {
        match self {
            EntityType::BusinessObject => &[
                ("domain", AttrKind::Text),
                ("steward", AttrKind::Text),
                ("criticality", AttrKind::Rank),
            ],
            EntityType::DataElement => &[
                ("technical_name", AttrKind::Text),
                ("data_type", AttrKind::Text),
                ("format", AttrKind::Text),
                ("domain", AttrKind::Text),
                ("sensitivity_level", AttrKind::Text),
            ],
            EntityType::Domain => &[
                ("owner", AttrKind::Text),
                ("steward", AttrKind::Text),
                ("maturity_level", AttrKind::Text),
                ("strategic_priority", AttrKind::Rank),
                ("data_classification_policy", AttrKind::Text),
            ],
            EntityType::BusinessRule => &[
                ("category", AttrKind::Text),
                ("obligation_level", AttrKind::Text),
                ("validation_logic", AttrKind::Text),
                ("source_reference", AttrKind::Text),
                ("effective_date", AttrKind::Text),
            ],
        }
    }

    /// Attributes that feed the embedding text, with their labels.
    fn embedded_attributes(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            EntityType::BusinessObject => &[("domain", "Domain")],
            EntityType::DataElement => &[
                ("technical_name", "Technical Name"),
                ("data_type", "Data Type"),
                ("format", "Format"),
                ("domain", "Domain"),
            ],
            EntityType::Domain => &[
                ("owner", "Owner"),
                ("data_classification_policy", "Policy"),
            ],
            EntityType::BusinessRule => &[
                ("category", "Category"),
                ("obligation_level", "Obligation"),
                ("validation_logic", "Logic"),
            ],
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "business_object" => Ok(EntityType::BusinessObject),
            "data_element" => Ok(EntityType::DataElement),
            "domain" => Ok(EntityType::Domain),
            "business_rule" | "rule" => Ok(EntityType::BusinessRule),
            other => Err(CatalogError::InvalidArgument(format!(
                "unknown entity type '{}', expected one of business_object, data_element, domain, business_rule",
                other
            ))),
        }
    }
}

/// Kind of scalar accepted for a documented attribute key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrKind {
    Text,
    /// Integer in `1..=5` (criticality, strategic priority).
    Rank,
}

/// A scalar attribute value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Integer(i) => write!(f, "{}", i),
            AttrValue::Float(x) => write!(f, "{}", x),
            AttrValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Integer(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

/// Variant-specific attribute map. Ordered so hashing is canonical.
pub type Attributes = BTreeMap<String, AttrValue>;

/// Typed, directed edge kinds of the catalog graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    /// Business object or data element → domain.
    BelongsToDomain,
    /// Business object → data element.
    ComposedOf,
    /// Business object or data element → business rule.
    GovernedByRule,
    /// Domain → business rule.
    EnforcesRule,
    /// Domain → parent domain.
    SubdomainOf,
    /// Business rule → related or dependent business rule.
    RelatedRule,
}

impl RelationshipType {
    pub const ALL: [RelationshipType; 6] = [
        RelationshipType::BelongsToDomain,
        RelationshipType::ComposedOf,
        RelationshipType::GovernedByRule,
        RelationshipType::EnforcesRule,
        RelationshipType::SubdomainOf,
        RelationshipType::RelatedRule,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::BelongsToDomain => "BELONGS_TO_DOMAIN",
            RelationshipType::ComposedOf => "COMPOSED_OF",
            RelationshipType::GovernedByRule => "GOVERNED_BY_RULE",
            RelationshipType::EnforcesRule => "ENFORCES_RULE",
            RelationshipType::SubdomainOf => "SUBDOMAIN_OF",
            RelationshipType::RelatedRule => "RELATED_RULE",
        }
    }

    /// Whether an edge of this kind may connect the given endpoint types.
    pub fn allows(&self, source: EntityType, target: EntityType) -> bool {
        use EntityType::*;
        match self {
            RelationshipType::BelongsToDomain => {
                matches!(source, BusinessObject | DataElement) && target == Domain
            }
            RelationshipType::ComposedOf => source == BusinessObject && target == DataElement,
            RelationshipType::GovernedByRule => {
                matches!(source, BusinessObject | DataElement) && target == BusinessRule
            }
            RelationshipType::EnforcesRule => source == Domain && target == BusinessRule,
            RelationshipType::SubdomainOf => source == Domain && target == Domain,
            RelationshipType::RelatedRule => source == BusinessRule && target == BusinessRule,
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationshipType {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_uppercase();
        RelationshipType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| {
                CatalogError::InvalidArgument(format!("unknown relationship type '{}'", s))
            })
    }
}

/// Which edges of a node to follow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
    #[default]
    Both,
}

// =============================================================================
// Newtype Wrappers - Identity
// =============================================================================

/// Stable, immutable identifier of a catalog entity.
///
/// Callers may supply their own ids (e.g. `BO-001`); generated ids are UUID v4.
/// Ordering is lexicographic and serves as the deterministic tie-break.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Generate a fresh UUID-based id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// =============================================================================
// Graph Structures
// =============================================================================

/// A typed directed edge. Identity is the `(source, target, rel_type)` triple.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub source: EntityId,
    pub target: EntityId,
    pub rel_type: RelationshipType,
}

impl Relationship {
    pub fn new(
        source: impl Into<EntityId>,
        target: impl Into<EntityId>,
        rel_type: RelationshipType,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            rel_type,
        }
    }

    /// Whether `id` is one of the endpoints.
    pub fn involves(&self, id: &EntityId) -> bool {
        &self.source == id || &self.target == id
    }

    /// The endpoint opposite to `id`, if `id` is an endpoint.
    pub fn other_end(&self, id: &EntityId) -> Option<&EntityId> {
        if &self.source == id {
            Some(&self.target)
        } else if &self.target == id {
            Some(&self.source)
        } else {
            None
        }
    }

    /// Reject self-loops and edges whose endpoint types the kind does not allow.
    pub fn validate_types(&self, source_type: EntityType, target_type: EntityType) -> Result<()> {
        if self.source == self.target {
            return Err(CatalogError::InvalidArgument(format!(
                "relationship {} cannot point {} at itself",
                self.rel_type, self.source
            )));
        }
        if !self.rel_type.allows(source_type, target_type) {
            return Err(CatalogError::InvalidArgument(format!(
                "{} does not connect {} to {}",
                self.rel_type, source_type, target_type
            )));
        }
        Ok(())
    }
}

/// Offset pagination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::first(100)
    }
}

// =============================================================================
// Entities
// =============================================================================

/// Write input for the entity store.
///
/// Embedding fields are deliberately absent: they are owned by the embedding
/// pipeline and never accepted from catalog writers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityDraft {
    #[serde(default = "EntityId::generate")]
    pub id: EntityId,
    pub entity_type: EntityType,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl EntityDraft {
    /// Start a draft with a freshly generated id.
    pub fn new(entity_type: EntityType, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: EntityId::generate(),
            entity_type,
            name: name.into(),
            description: description.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<EntityId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Check identity, name and the variant's attribute key set.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_blank() {
            return Err(CatalogError::InvalidArgument("entity id must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(CatalogError::InvalidArgument(format!(
                "entity {} must have a name",
                self.id
            )));
        }

        let schema = self.entity_type.attribute_schema();
        for (key, value) in &self.attributes {
            let kind = schema
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, kind)| *kind)
                .ok_or_else(|| {
                    CatalogError::InvalidArgument(format!(
                        "attribute '{}' is not defined for {}",
                        key, self.entity_type
                    ))
                })?;

            let ok = match (kind, value) {
                (AttrKind::Text, AttrValue::Text(_)) => true,
                (AttrKind::Rank, AttrValue::Integer(n)) => (1..=5).contains(n),
                _ => false,
            };
            if !ok {
                return Err(CatalogError::InvalidArgument(format!(
                    "attribute '{}' of {} has invalid value {}",
                    key, self.entity_type, value
                )));
            }
        }
        Ok(())
    }

    pub fn content_hash(&self) -> String {
        content_hash(self.entity_type, &self.name, &self.description, &self.attributes)
    }
}

/// A catalog entity as persisted in the entity store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub entity_type: EntityType,
    pub name: String,
    pub description: String,
    pub attributes: Attributes,
    /// Null until first computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Incremented on every recompute; 0 means never embedded.
    pub embedding_version: u64,
    /// Hash of the current description-affecting content.
    pub content_hash: String,
    /// Content hash the stored embedding was computed from.
    pub embedded_hash: Option<String>,
    /// Model identity the stored embedding was computed with.
    pub embedding_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Whether the stored embedding is missing or no longer reflects the
    /// entity's content under `model`.
    pub fn is_stale(&self, model: &str) -> bool {
        self.embedding.is_none()
            || self.embedded_hash.as_deref() != Some(self.content_hash.as_str())
            || self.embedding_model.as_deref() != Some(model)
    }

    /// An entity without description text has nothing meaningful to embed.
    pub fn has_embeddable_content(&self) -> bool {
        !self.description.trim().is_empty()
    }

    pub fn embedding_text(&self) -> String {
        embedding_text(self.entity_type, &self.name, &self.description, &self.attributes)
    }

    pub fn summary(&self) -> EntitySummary {
        EntitySummary {
            id: self.id.clone(),
            entity_type: self.entity_type,
            name: self.name.clone(),
        }
    }
}

/// Lightweight reference to an entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub id: EntityId,
    pub entity_type: EntityType,
    pub name: String,
}

/// The text an entity is embedded from.
///
/// `Name: … Description: …` followed by the variant's labelled attributes,
/// skipping any that are absent.
pub fn embedding_text(
    entity_type: EntityType,
    name: &str,
    description: &str,
    attributes: &Attributes,
) -> String {
    let mut parts = vec![
        format!("Name: {}", name.trim()),
        format!("Description: {}", description.trim()),
    ];
    for (key, label) in entity_type.embedded_attributes() {
        if let Some(value) = attributes.get(*key) {
            let rendered = value.to_string();
            if !rendered.trim().is_empty() {
                parts.push(format!("{}: {}", label, rendered.trim()));
            }
        }
    }
    parts.join(" ")
}

/// SHA-256 over type, name, description and canonical attributes (hex).
pub fn content_hash(
    entity_type: EntityType,
    name: &str,
    description: &str,
    attributes: &Attributes,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(description.as_bytes());
    hasher.update([0u8]);
    // BTreeMap serializes in key order, so this is canonical.
    let attrs = serde_json::to_string(attributes).unwrap_or_default();
    hasher.update(attrs.as_bytes());
    hex::encode(hasher.finalize())
}

//! Declared shapes of dimensions and fact tables.
//!
//! Schemas are deserialised from configuration. Their names end up as SQL
//! identifiers in the persisted views, so every name is validated against a
//! conservative identifier grammar.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Column names owned by the dimension view; attributes may not reuse them.
const DIMENSION_RESERVED: &[&str] =
  &["surrogate_key", "natural_key", "valid_from", "valid_to", "is_current"];

/// Column names owned by the fact view; measures may not reuse them.
const FACT_RESERVED: &[&str] = &["order_id", "line", "revision", "kind"];

// ─── Dimensions ──────────────────────────────────────────────────────────────

/// The type an attribute is normalised to.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Default,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttrType {
  #[default]
  Text,
  Integer,
  Decimal,
  Date,
  Boolean,
}

/// One versioned attribute of a dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSpec {
  pub name:     String,
  #[serde(rename = "type", default)]
  pub kind:     AttrType,
  /// Rows with no value for a required attribute are rejected.
  #[serde(default)]
  pub required: bool,
}

/// A dimension and the fixed set of attributes that are versioned for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionSchema {
  pub name:       String,
  pub attributes: Vec<AttributeSpec>,
}

impl DimensionSchema {
  pub fn attribute(&self, name: &str) -> Option<&AttributeSpec> {
    self.attributes.iter().find(|a| a.name == name)
  }

  pub fn validate(&self) -> Result<()> {
    validate_identifier(&self.name)?;
    let mut seen = HashSet::new();
    for attr in &self.attributes {
      validate_identifier(&attr.name)?;
      if DIMENSION_RESERVED.contains(&attr.name.as_str()) {
        return Err(Error::InvalidSchema(format!(
          "dimension {}: attribute name {:?} is reserved",
          self.name, attr.name
        )));
      }
      if !seen.insert(attr.name.as_str()) {
        return Err(Error::InvalidSchema(format!(
          "dimension {}: duplicate attribute {:?}",
          self.name, attr.name
        )));
      }
    }
    Ok(())
  }
}

// ─── Facts ───────────────────────────────────────────────────────────────────

/// What the fact assembler does with a role it cannot resolve.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Default,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UnresolvedPolicy {
  /// Write the fact with [`crate::dimension::SurrogateKey::UNKNOWN`] for the
  /// role and record the role on the row.
  #[default]
  UnknownMember,
  /// Divert the whole event to the quarantine stream.
  Quarantine,
}

/// A dimension referenced by a fact table under a role name. Several roles
/// may reference the same dimension (e.g. order-date vs ship-date product).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
  pub name:          String,
  pub dimension:     String,
  #[serde(default)]
  pub on_unresolved: UnresolvedPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactSchema {
  pub name:     String,
  pub roles:    Vec<RoleSpec>,
  #[serde(default)]
  pub measures: Vec<String>,
}

impl FactSchema {
  pub fn role(&self, name: &str) -> Option<&RoleSpec> {
    self.roles.iter().find(|r| r.name == name)
  }

  /// Validate names and check that every role references a declared
  /// dimension.
  pub fn validate(&self, dimensions: &[DimensionSchema]) -> Result<()> {
    validate_identifier(&self.name)?;

    let mut columns: HashSet<String> =
      FACT_RESERVED.iter().map(|s| (*s).to_owned()).collect();

    for role in &self.roles {
      validate_identifier(&role.name)?;
      if !dimensions.iter().any(|d| d.name == role.dimension) {
        return Err(Error::InvalidSchema(format!(
          "fact {}: role {:?} references unknown dimension {:?}",
          self.name, role.name, role.dimension
        )));
      }
      if !columns.insert(format!("{}_key", role.name)) {
        return Err(Error::InvalidSchema(format!(
          "fact {}: duplicate role {:?}",
          self.name, role.name
        )));
      }
    }

    for measure in &self.measures {
      validate_identifier(measure)?;
      if !columns.insert(measure.clone()) {
        return Err(Error::InvalidSchema(format!(
          "fact {}: measure {measure:?} collides with another column",
          self.name
        )));
      }
    }
    Ok(())
  }
}

// ─── Identifiers ─────────────────────────────────────────────────────────────

/// Accept `[a-z_][a-z0-9_]*`, at most 63 bytes.
pub fn validate_identifier(name: &str) -> Result<()> {
  let mut chars = name.chars();
  let valid_head = chars
    .next()
    .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
  let valid_tail =
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

  if valid_head && valid_tail && name.len() <= 63 {
    Ok(())
  } else {
    Err(Error::InvalidIdentifier(name.to_owned()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn product() -> DimensionSchema {
    DimensionSchema {
      name:       "product".into(),
      attributes: vec![
        AttributeSpec {
          name:     "category".into(),
          kind:     AttrType::Text,
          required: true,
        },
        AttributeSpec {
          name:     "list_price".into(),
          kind:     AttrType::Decimal,
          required: false,
        },
      ],
    }
  }

  #[test]
  fn identifiers() {
    assert!(validate_identifier("sub_category").is_ok());
    assert!(validate_identifier("_x1").is_ok());
    assert!(validate_identifier("").is_err());
    assert!(validate_identifier("1abc").is_err());
    assert!(validate_identifier("Category").is_err());
    assert!(validate_identifier("a; DROP TABLE x").is_err());
  }

  #[test]
  fn reserved_attribute_names_are_rejected() {
    let mut schema = product();
    schema.attributes.push(AttributeSpec {
      name:     "valid_to".into(),
      kind:     AttrType::Date,
      required: false,
    });
    assert!(matches!(schema.validate(), Err(Error::InvalidSchema(_))));
  }

  #[test]
  fn fact_roles_must_reference_known_dimensions() {
    let fact = FactSchema {
      name:     "orders".into(),
      roles:    vec![RoleSpec {
        name:          "customer".into(),
        dimension:     "customer".into(),
        on_unresolved: UnresolvedPolicy::Quarantine,
      }],
      measures: vec!["sales".into()],
    };
    assert!(fact.validate(&[product()]).is_err());
  }

  #[test]
  fn measure_may_not_shadow_a_role_column() {
    let fact = FactSchema {
      name:     "orders".into(),
      roles:    vec![RoleSpec {
        name:          "product".into(),
        dimension:     "product".into(),
        on_unresolved: UnresolvedPolicy::default(),
      }],
      measures: vec!["product_key".into()],
    };
    assert!(fact.validate(&[product()]).is_err());
  }

  #[test]
  fn policy_strings() {
    assert_eq!(UnresolvedPolicy::UnknownMember.to_string(), "unknown_member");
    assert_eq!(
      "quarantine".parse::<UnresolvedPolicy>().unwrap(),
      UnresolvedPolicy::Quarantine
    );
    assert_eq!("decimal".parse::<AttrType>().unwrap(), AttrType::Decimal);
  }
}

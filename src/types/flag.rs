use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
    Boolean,
    Rollout,
    Multivariant,
}

impl FlagType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            FlagType::Boolean => "boolean",
            FlagType::Rollout => "rollout",
            FlagType::Multivariant => "multivariant",
        }
    }
}

impl FromStr for FlagType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boolean" => Ok(FlagType::Boolean),
            "rollout" => Ok(FlagType::Rollout),
            "multivariant" => Ok(FlagType::Multivariant),
            other => Err(format!("unknown flag type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagStatus {
    Active,
    Inactive,
    Archived,
}

impl FlagStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            FlagStatus::Active => "active",
            FlagStatus::Inactive => "inactive",
            FlagStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for FlagStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlagStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(FlagStatus::Active),
            "inactive" => Ok(FlagStatus::Inactive),
            "archived" => Ok(FlagStatus::Archived),
            other => Err(format!("unknown flag status: {other}")),
        }
    }
}

/// The single owner of a flag. Keys are unique per scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum FlagScope {
    Website(String),
    Organization(String),
    User(String),
}

impl FlagScope {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            FlagScope::Website(_) => "website",
            FlagScope::Organization(_) => "organization",
            FlagScope::User(_) => "user",
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            FlagScope::Website(id) | FlagScope::Organization(id) | FlagScope::User(id) => id,
        }
    }

    pub fn from_parts(kind: &str, id: String) -> Result<Self, String> {
        match kind {
            "website" => Ok(FlagScope::Website(id)),
            "organization" => Ok(FlagScope::Organization(id)),
            "user" => Ok(FlagScope::User(id)),
            other => Err(format!("unknown scope kind: {other}")),
        }
    }

    /// Prefix used by cache keys, e.g. `website:abc`.
    #[must_use]
    pub fn cache_key(&self) -> String {
        match self {
            FlagScope::Website(id) => format!("website:{id}"),
            FlagScope::Organization(id) => format!("org:{id}"),
            FlagScope::User(id) => format!("user:{id}"),
        }
    }
}

impl fmt::Display for FlagScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    UserId,
    Email,
    Property,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Exists,
    NotExists,
}

/// Targeting rule. Only the evaluator reads these; scheduling never touches them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetingRule {
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub operator: RuleOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    pub enabled: bool,
    #[serde(default)]
    pub batch: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batch_values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantType {
    String,
    Number,
    Boolean,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
    #[serde(rename = "type")]
    pub variant_type: VariantType,
}

/// Checks the weight invariant: once any variant declares a weight, every weight
/// is within 0..=100 and the declared weights add up to exactly 100.
pub fn validate_variant_weights(variants: &[Variant]) -> Result<(), String> {
    if variants.iter().all(|v| v.weight.is_none()) {
        return Ok(());
    }

    if let Some(bad) = variants
        .iter()
        .find(|v| v.weight.is_some_and(|w| !(0..=100).contains(&w)))
    {
        return Err(format!(
            "Variant '{}' weight must be between 0 and 100",
            bad.key
        ));
    }

    let total: i64 = variants.iter().filter_map(|v| v.weight).sum();
    if total != 100 {
        return Err(format!("Variant weights must sum to 100 (got {total})"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub id: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub status: FlagStatus,
    pub default_value: bool,
    pub rollout_percentage: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_by: Option<String>,
    #[serde(default)]
    pub rules: Vec<TargetingRule>,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub scope: FlagScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flag {
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.status == FlagStatus::Archived
    }

    #[must_use]
    pub fn depends_on(&self, key: &str) -> bool {
        self.dependencies.iter().any(|d| d == key)
    }
}

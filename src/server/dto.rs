use serde::Deserialize;

use crate::server::response::ApiError;
use crate::types::{FlagScope, FlagStatus, FlagType, TargetingRule, Variant};

/// Owner of a new flag. Exactly one field must be set.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeParams {
    #[serde(default)]
    pub website_id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn scope_from(
    website_id: Option<&str>,
    organization_id: Option<&str>,
    user_id: Option<&str>,
) -> Result<FlagScope, ApiError> {
    match (website_id, organization_id, user_id) {
        (Some(id), None, None) => Ok(FlagScope::Website(id.to_string())),
        (None, Some(id), None) => Ok(FlagScope::Organization(id.to_string())),
        (None, None, Some(id)) => Ok(FlagScope::User(id.to_string())),
        (None, None, None) => Err(ApiError::bad_request(
            "One of websiteId, organizationId or userId must be provided",
        )),
        _ => Err(ApiError::bad_request(
            "Only one of websiteId, organizationId or userId may be provided",
        )),
    }
}

impl ScopeParams {
    pub fn scope(&self) -> Result<FlagScope, ApiError> {
        scope_from(
            self.website_id.as_deref(),
            self.organization_id.as_deref(),
            self.user_id.as_deref(),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct ListFlagsParams {
    #[serde(default)]
    pub website_id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: Option<FlagStatus>,
}

impl ListFlagsParams {
    pub fn scope(&self) -> Result<FlagScope, ApiError> {
        scope_from(
            self.website_id.as_deref(),
            self.organization_id.as_deref(),
            self.user_id.as_deref(),
        )
    }
}

/// Optional owner for single-flag reads. When present, the read may be served
/// from the cache.
#[derive(Debug, Default, Deserialize)]
pub struct FlagLookupParams {
    #[serde(default)]
    pub website_id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl FlagLookupParams {
    pub fn scope(&self) -> Result<Option<FlagScope>, ApiError> {
        if self.website_id.is_none() && self.organization_id.is_none() && self.user_id.is_none() {
            return Ok(None);
        }
        scope_from(
            self.website_id.as_deref(),
            self.organization_id.as_deref(),
            self.user_id.as_deref(),
        )
        .map(Some)
    }
}

fn default_flag_type() -> FlagType {
    FlagType::Boolean
}

fn default_status() -> FlagStatus {
    FlagStatus::Active
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlagRequest {
    #[serde(flatten)]
    pub scope: ScopeParams,
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default = "default_flag_type")]
    pub flag_type: FlagType,
    #[serde(default = "default_status")]
    pub status: FlagStatus,
    #[serde(default)]
    pub default_value: bool,
    #[serde(default)]
    pub rollout_percentage: i64,
    #[serde(default)]
    pub rollout_by: Option<String>,
    #[serde(default)]
    pub rules: Vec<TargetingRule>,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub environment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFlagRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub flag_type: Option<FlagType>,
    #[serde(default)]
    pub status: Option<FlagStatus>,
    #[serde(default)]
    pub default_value: Option<bool>,
    #[serde(default)]
    pub rollout_percentage: Option<i64>,
    #[serde(default)]
    pub rollout_by: Option<String>,
    #[serde(default)]
    pub rules: Option<Vec<TargetingRule>>,
    #[serde(default)]
    pub variants: Option<Vec<Variant>>,
    #[serde(default)]
    pub dependencies: Option<Vec<String>>,
    #[serde(default)]
    pub environment: Option<String>,
}

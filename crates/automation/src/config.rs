//! Typed per-handler action configuration.
//!
//! Stored configs are JSON blobs; they are parsed into an [`ActionConfig`]
//! variant keyed by action type at the boundary (authoring and again before
//! each execution) so handlers only ever see a validated schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use thiserror::Error;

use stockflow_core::{EntityId, LocationId, ProductId, WarehouseId};
use stockflow_inventory::AllocationStrategy;

use crate::rule::{ActionTemplate, RuleAction};

pub mod action_types {
    pub const CHECK_INVENTORY: &str = "check_inventory";
    pub const CHECK_REORDER_POINT: &str = "check_reorder_point";
    pub const RESERVE_INVENTORY: &str = "reserve_inventory";
    pub const COMMIT_ALLOCATION: &str = "commit_allocation";
    pub const RELEASE_RESERVATION: &str = "release_reservation";
    pub const RECEIVE_INVENTORY: &str = "receive_inventory";

    pub const ALL: [&str; 6] = [
        CHECK_INVENTORY,
        CHECK_REORDER_POINT,
        RESERVE_INVENTORY,
        COMMIT_ALLOCATION,
        RELEASE_RESERVATION,
        RECEIVE_INVENTORY,
    ];
}

/// Longest hold a reservation may request: one leap year.
pub const MAX_RESERVATION_HOURS: i64 = 366 * 24;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown action type: {0}")]
    UnknownActionType(String),

    #[error("{action_type} config is malformed: {message}")]
    Malformed { action_type: String, message: String },

    #[error("{action_type} config is invalid: {message}")]
    Invalid { action_type: String, message: String },

    #[error("template {template} provides {found} defaults, action is {expected}")]
    TemplateMismatch {
        template: String,
        expected: String,
        found: String,
    },

    #[error("handler {handler} cannot run {found} config")]
    WrongHandler { handler: String, found: String },
}

impl ConfigError {
    fn invalid(action_type: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            action_type: action_type.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckInventoryConfig {
    #[serde(default)]
    pub product_id: Option<ProductId>,
    /// Take `product_id` from the triggering line item instead.
    #[serde(default)]
    pub source_from_line_item: bool,
    pub threshold: i64,
    #[serde(default)]
    pub warehouse_id: Option<WarehouseId>,
    #[serde(default)]
    pub location_id: Option<LocationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckReorderPointConfig {
    #[serde(default)]
    pub product_id: Option<ProductId>,
    #[serde(default)]
    pub source_from_line_item: bool,
    /// Overrides the stored reorder point when set.
    #[serde(default)]
    pub custom_threshold: Option<i64>,
    #[serde(default)]
    pub warehouse_id: Option<WarehouseId>,
    #[serde(default)]
    pub location_id: Option<LocationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReserveInventoryConfig {
    #[serde(default)]
    pub product_id: Option<ProductId>,
    /// Take `product_id` and, when `quantity` is zero, the quantity from the
    /// triggering line item.
    #[serde(default)]
    pub source_from_line_item: bool,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub warehouse_id: Option<WarehouseId>,
    #[serde(default)]
    pub location_id: Option<LocationId>,
    #[serde(default)]
    pub allocation_strategy: AllocationStrategy,
    #[serde(default)]
    pub reservation_duration_hours: Option<i64>,
    #[serde(default)]
    pub allow_partial: bool,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub reference_type: Option<String>,
}

/// Shared shape of `commit_allocation` and `release_reservation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StockMoveConfig {
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiveInventoryConfig {
    #[serde(default)]
    pub product_id: Option<ProductId>,
    #[serde(default)]
    pub quantity: Option<i64>,
    pub location_id: LocationId,
    /// Resolve product and quantity from a purchase-order line item.
    #[serde(default)]
    pub source_from_po: bool,
    #[serde(default)]
    pub po_line_item_id: Option<EntityId>,
    #[serde(default)]
    pub reference_number: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", content = "config", rename_all = "snake_case")]
pub enum ActionConfig {
    CheckInventory(CheckInventoryConfig),
    CheckReorderPoint(CheckReorderPointConfig),
    ReserveInventory(ReserveInventoryConfig),
    CommitAllocation(StockMoveConfig),
    ReleaseReservation(StockMoveConfig),
    ReceiveInventory(ReceiveInventoryConfig),
}

impl ActionConfig {
    /// Parse a stored config blob for `action_type`. Does not validate.
    pub fn parse(action_type: &str, config: &JsonValue) -> Result<Self, ConfigError> {
        if !action_types::ALL.contains(&action_type) {
            return Err(ConfigError::UnknownActionType(action_type.to_string()));
        }
        let config = if config.is_null() { json!({}) } else { config.clone() };
        serde_json::from_value(json!({ "action_type": action_type, "config": config })).map_err(|e| {
            ConfigError::Malformed {
                action_type: action_type.to_string(),
                message: e.to_string(),
            }
        })
    }

    /// Effective, validated config for `action`: template defaults with the
    /// action's own keys laid over them (top level only).
    pub fn resolve(action: &RuleAction, template: Option<&ActionTemplate>) -> Result<Self, ConfigError> {
        let merged = match template {
            Some(t) if t.action_type != action.action_type => {
                return Err(ConfigError::TemplateMismatch {
                    template: t.name.clone(),
                    expected: action.action_type.clone(),
                    found: t.action_type.clone(),
                });
            }
            Some(t) => shallow_merge(&t.default_config, &action.config),
            None => action.config.clone(),
        };
        let config = Self::parse(&action.action_type, &merged)?;
        config.validate()?;
        Ok(config)
    }

    pub fn action_type(&self) -> &'static str {
        match self {
            ActionConfig::CheckInventory(_) => action_types::CHECK_INVENTORY,
            ActionConfig::CheckReorderPoint(_) => action_types::CHECK_REORDER_POINT,
            ActionConfig::ReserveInventory(_) => action_types::RESERVE_INVENTORY,
            ActionConfig::CommitAllocation(_) => action_types::COMMIT_ALLOCATION,
            ActionConfig::ReleaseReservation(_) => action_types::RELEASE_RESERVATION,
            ActionConfig::ReceiveInventory(_) => action_types::RECEIVE_INVENTORY,
        }
    }

    /// Semantic checks beyond the schema.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.action_type();
        match self {
            ActionConfig::CheckInventory(c) => {
                require_product(t, c.product_id, c.source_from_line_item)?;
                if c.threshold < 0 {
                    return Err(ConfigError::invalid(t, "threshold cannot be negative"));
                }
            }
            ActionConfig::CheckReorderPoint(c) => {
                require_product(t, c.product_id, c.source_from_line_item)?;
                if c.custom_threshold.is_some_and(|v| v < 0) {
                    return Err(ConfigError::invalid(t, "custom_threshold cannot be negative"));
                }
            }
            ActionConfig::ReserveInventory(c) => {
                require_product(t, c.product_id, c.source_from_line_item)?;
                if c.quantity < 0 || (c.quantity == 0 && !c.source_from_line_item) {
                    return Err(ConfigError::invalid(t, "quantity must be positive"));
                }
                if !c.allocation_strategy.is_supported() {
                    return Err(ConfigError::invalid(
                        t,
                        format!("allocation strategy '{}' is not available", c.allocation_strategy),
                    ));
                }
                if c.reservation_duration_hours.is_some_and(|h| h <= 0) {
                    return Err(ConfigError::invalid(t, "reservation_duration_hours must be positive"));
                }
                if c.reservation_duration_hours.is_some_and(|h| h > MAX_RESERVATION_HOURS) {
                    return Err(ConfigError::invalid(
                        t,
                        format!("reservation_duration_hours cannot exceed {MAX_RESERVATION_HOURS}"),
                    ));
                }
            }
            ActionConfig::CommitAllocation(c) | ActionConfig::ReleaseReservation(c) => {
                if c.quantity <= 0 {
                    return Err(ConfigError::invalid(t, "quantity must be positive"));
                }
            }
            ActionConfig::ReceiveInventory(c) => {
                if c.quantity.is_some_and(|q| q <= 0) {
                    return Err(ConfigError::invalid(t, "quantity must be positive"));
                }
                if !c.source_from_po && (c.product_id.is_none() || c.quantity.is_none()) {
                    return Err(ConfigError::invalid(
                        t,
                        "product_id and quantity are required unless source_from_po is set",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn require_product(action_type: &str, product: Option<ProductId>, from_line_item: bool) -> Result<(), ConfigError> {
    if product.is_none() && !from_line_item {
        return Err(ConfigError::invalid(
            action_type,
            "product_id is required unless source_from_line_item is set",
        ));
    }
    Ok(())
}

fn shallow_merge(defaults: &JsonValue, overrides: &JsonValue) -> JsonValue {
    let mut merged: Map<String, JsonValue> = defaults.as_object().cloned().unwrap_or_default();
    match overrides {
        JsonValue::Object(o) => {
            for (k, v) in o {
                merged.insert(k.clone(), v.clone());
            }
            JsonValue::Object(merged)
        }
        JsonValue::Null => JsonValue::Object(merged),
        other => other.clone(),
    }
}

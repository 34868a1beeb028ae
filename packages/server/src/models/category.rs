use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::shared::double_option;
use crate::entity::category;
use crate::error::AppError;

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CategoryResponse {
    pub id: i32,
    #[schema(example = "Sabbath")]
    pub name: String,
    pub description: Option<String>,
    #[schema(example = "#3b82f6")]
    pub color: Option<String>,
    pub icon: Option<String>,
    pub sort_order: i32,
    pub is_active: bool,
    /// Live files in the category.
    pub file_count: u64,
    pub created_by: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CategoryResponse {
    pub fn new(m: category::Model, file_count: u64) -> Self {
        Self {
            id: m.id,
            name: m.name,
            description: m.description,
            color: m.color,
            icon: m.icon,
            sort_order: m.sort_order,
            is_active: m.is_active,
            file_count,
            created_by: m.created_by,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateCategoryRequest {
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
    pub icon: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
}

/// Absent fields are left unchanged; `null` clears an optional field.
#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
pub struct UpdateCategoryRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<String>)]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<String>)]
    pub color: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<String>)]
    pub icon: Option<Option<String>>,
    pub sort_order: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct CategoryListQuery {
    /// Include deactivated categories. Default: false.
    #[serde(default)]
    pub include_inactive: bool,
}

pub fn validate_category_name(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > 100 {
        return Err(AppError::Validation(
            "Category name must be 1-100 characters".into(),
        ));
    }
    Ok(name.to_string())
}

/// `#rgb` or `#rrggbb`.
pub fn validate_color(color: &str) -> Result<(), AppError> {
    let valid = color
        .strip_prefix('#')
        .is_some_and(|hex| matches!(hex.len(), 3 | 6) && hex.chars().all(|c| c.is_ascii_hexdigit()));
    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Invalid color '{color}', expected #rgb or #rrggbb"
        )))
    }
}

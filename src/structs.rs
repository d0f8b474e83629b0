use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Deserialize, Serialize, Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, FromRow)]
pub struct Item {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub quantity: i64,
    pub user_id: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// One entry of the append-only sale log.
#[derive(Deserialize, Serialize, Debug, Clone, FromRow)]
pub struct Sale {
    pub id: i64,
    pub item_id: i64,
    pub user_id: i64,
    pub quantity: i64,
    pub sold_at: NaiveDateTime,
}

/// Editable fields of an item, shared by create and update.
#[derive(Debug, Clone)]
pub struct ItemFields {
    pub name: String,
    pub description: String,
    pub quantity: i64,
}

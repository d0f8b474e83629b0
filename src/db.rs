use chrono::NaiveDateTime;

use crate::{
    errors::AppError,
    structs::{Item, ItemFields, Sale, User},
    utils, AppState,
};

pub async fn find_user_by_id(state: &AppState, id: i64) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db_pool)
        .await
}

pub async fn find_user_by_username(
    state: &AppState,
    username: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = $1")
        .bind(username)
        .fetch_optional(&state.db_pool)
        .await
}

pub async fn find_user_by_email(
    state: &AppState,
    email: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
        .bind(email)
        .fetch_optional(&state.db_pool)
        .await
}

pub async fn create_user(
    state: &AppState,
    username: &str,
    email: &str,
    password: &str,
) -> Result<User, AppError> {
    let created_at = chrono::Utc::now().naive_utc();
    let password_hash = utils::hash_password(password).map_err(|e| {
        log::error!("Failed to hash password: {}", e);
        AppError::PasswordError(e.to_string())
    })?;
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (username, email, password_hash, created_at, updated_at) VALUES ($1, $2, $3, $4, $5) RETURNING *",
    )
    .bind(username)
    .bind(email)
    .bind(password_hash)
    .bind(created_at)
    .bind(created_at)
    .fetch_one(&state.db_pool)
    .await?;
    log::info!("User created: id={} username={}", user.id, user.username);
    Ok(user)
}

pub async fn update_password(state: &AppState, id: i64, password: &str) -> Result<User, AppError> {
    let updated_at = chrono::Utc::now().naive_utc();
    let password_hash = utils::hash_password(password).map_err(|e| {
        log::error!("Failed to hash password: {}", e);
        AppError::PasswordError(e.to_string())
    })?;
    let user = sqlx::query_as::<_, User>(
        "UPDATE users SET password_hash = $1, updated_at = $2 WHERE id = $3 RETURNING *",
    )
    .bind(password_hash)
    .bind(updated_at)
    .bind(id)
    .fetch_one(&state.db_pool)
    .await?;
    log::info!("Password updated for user id={}", user.id);
    Ok(user)
}

pub async fn list_items(state: &AppState, user_id: i64) -> Result<Vec<Item>, sqlx::Error> {
    sqlx::query_as::<_, Item>("SELECT * FROM items WHERE user_id = $1 ORDER BY id")
        .bind(user_id)
        .fetch_all(&state.db_pool)
        .await
}

/// Looks an item up by id alone; callers compare `user_id` themselves so they
/// can tell "missing" from "someone else's".
pub async fn get_item(state: &AppState, id: i64) -> Result<Option<Item>, sqlx::Error> {
    sqlx::query_as::<_, Item>("SELECT * FROM items WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db_pool)
        .await
}

pub async fn create_item(
    state: &AppState,
    user_id: i64,
    fields: &ItemFields,
) -> Result<Item, sqlx::Error> {
    let created_at = chrono::Utc::now().naive_utc();
    let item = sqlx::query_as::<_, Item>(
        "INSERT INTO items (name, description, quantity, user_id, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
    )
    .bind(&fields.name)
    .bind(&fields.description)
    .bind(fields.quantity)
    .bind(user_id)
    .bind(created_at)
    .bind(created_at)
    .fetch_one(&state.db_pool)
    .await?;
    log::info!("Item created: id={} user_id={}", item.id, user_id);
    Ok(item)
}

/// Returns `None` when no item with this id belongs to `user_id`.
pub async fn update_item(
    state: &AppState,
    id: i64,
    user_id: i64,
    fields: &ItemFields,
) -> Result<Option<Item>, sqlx::Error> {
    let updated_at = chrono::Utc::now().naive_utc();
    let item = sqlx::query_as::<_, Item>(
        "UPDATE items SET name = $1, description = $2, quantity = $3, updated_at = $4 WHERE id = $5 AND user_id = $6 RETURNING *",
    )
    .bind(&fields.name)
    .bind(&fields.description)
    .bind(fields.quantity)
    .bind(updated_at)
    .bind(id)
    .bind(user_id)
    .fetch_optional(&state.db_pool)
    .await?;
    if let Some(item) = &item {
        log::info!("Item updated: id={} user_id={}", item.id, user_id);
    }
    Ok(item)
}

/// Deletes the item and, through the foreign key, its sales. Returns whether
/// a row was removed.
pub async fn delete_item(state: &AppState, id: i64, user_id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM items WHERE id = $1 AND user_id = $2")
        .bind(id)
        .bind(user_id)
        .execute(&state.db_pool)
        .await?;
    let deleted = result.rows_affected() > 0;
    if deleted {
        log::info!("Item with id {} deleted", id);
    }
    Ok(deleted)
}

/// Appends a sale and takes its quantity off the item's stock in one
/// transaction. Returns `None`, with nothing written, when the item does not
/// belong to `user_id` or has less than `quantity` on hand.
pub async fn record_sale(
    state: &AppState,
    user_id: i64,
    item_id: i64,
    quantity: i64,
    sold_at: NaiveDateTime,
) -> Result<Option<Sale>, sqlx::Error> {
    let mut tx = state.db_pool.begin().await?;

    let updated_at = chrono::Utc::now().naive_utc();
    let decremented = sqlx::query(
        "UPDATE items SET quantity = quantity - $1, updated_at = $2 WHERE id = $3 AND user_id = $4 AND quantity >= $5",
    )
    .bind(quantity)
    .bind(updated_at)
    .bind(item_id)
    .bind(user_id)
    .bind(quantity)
    .execute(&mut *tx)
    .await?;
    if decremented.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(None);
    }

    let sale = sqlx::query_as::<_, Sale>(
        "INSERT INTO sales (item_id, user_id, quantity, sold_at) VALUES ($1, $2, $3, $4) RETURNING *",
    )
    .bind(item_id)
    .bind(user_id)
    .bind(quantity)
    .bind(sold_at)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    log::info!(
        "Sale recorded: id={} item_id={} quantity={}",
        sale.id,
        item_id,
        quantity
    );
    Ok(Some(sale))
}

pub async fn list_sales_for_item(
    state: &AppState,
    user_id: i64,
    item_id: i64,
) -> Result<Vec<Sale>, sqlx::Error> {
    sqlx::query_as::<_, Sale>(
        "SELECT * FROM sales WHERE item_id = $1 AND user_id = $2 ORDER BY sold_at, id",
    )
    .bind(item_id)
    .bind(user_id)
    .fetch_all(&state.db_pool)
    .await
}

#[cfg(test)]
pub mod test_support {
    use std::str::FromStr;

    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    use crate::AppState;

    /// A migrated in-memory database. One connection that never expires, so
    /// every query sees the same database.
    pub async fn memory_state() -> AppState {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .foreign_keys(true);
        let db_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .unwrap();
        sqlx::migrate!().run(&db_pool).await.unwrap();
        AppState { db_pool }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn fields(name: &str, quantity: i64) -> ItemFields {
        ItemFields {
            name: name.to_owned(),
            description: String::new(),
            quantity,
        }
    }

    fn noon(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[actix_web::test]
    async fn usernames_are_unique() {
        let state = test_support::memory_state().await;
        create_user(&state, "alice", "alice@example.com", "long enough password")
            .await
            .unwrap();

        let err = create_user(&state, "alice", "other@example.com", "long enough password")
            .await
            .unwrap_err();
        match err {
            AppError::DatabaseError(sqlx::Error::Database(e)) => assert!(e.is_unique_violation()),
            other => panic!("expected unique violation, got {:?}", other),
        }
    }

    #[actix_web::test]
    async fn item_updates_are_scoped_to_owner() {
        let state = test_support::memory_state().await;
        let alice = create_user(&state, "alice", "a@example.com", "long enough password")
            .await
            .unwrap();
        let bob = create_user(&state, "bob", "b@example.com", "long enough password")
            .await
            .unwrap();
        let item = create_item(&state, alice.id, &fields("Widget", 3)).await.unwrap();

        let denied = update_item(&state, item.id, bob.id, &fields("Stolen", 0))
            .await
            .unwrap();
        assert!(denied.is_none());
        assert!(!delete_item(&state, item.id, bob.id).await.unwrap());
        assert_eq!(get_item(&state, item.id).await.unwrap(), Some(item.clone()));

        let updated = update_item(&state, item.id, alice.id, &fields("Gadget", 9))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "Gadget");
        assert_eq!(updated.quantity, 9);
    }

    #[actix_web::test]
    async fn sales_decrement_stock_and_cascade_on_delete() {
        let state = test_support::memory_state().await;
        let alice = create_user(&state, "alice", "a@example.com", "long enough password")
            .await
            .unwrap();
        let item = create_item(&state, alice.id, &fields("Widget", 5)).await.unwrap();

        let later = record_sale(&state, alice.id, item.id, 2, noon(2025, 2, 2))
            .await
            .unwrap();
        let earlier = record_sale(&state, alice.id, item.id, 1, noon(2025, 1, 1))
            .await
            .unwrap();
        assert!(later.is_some() && earlier.is_some());
        assert!(record_sale(&state, alice.id, item.id, 3, noon(2025, 3, 3))
            .await
            .unwrap()
            .is_none());

        let stock = get_item(&state, item.id).await.unwrap().unwrap().quantity;
        assert_eq!(stock, 2);

        let sales = list_sales_for_item(&state, alice.id, item.id).await.unwrap();
        let quantities: Vec<i64> = sales.iter().map(|s| s.quantity).collect();
        assert_eq!(quantities, vec![1, 2]);

        assert!(delete_item(&state, item.id, alice.id).await.unwrap());
        assert!(list_sales_for_item(&state, alice.id, item.id)
            .await
            .unwrap()
            .is_empty());
    }
}

use crate::model::{NewAccount, Role, User};
use anyhow::{Context, Result};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

/// Account repository: users, their profile and role.
#[derive(Debug, Clone)]
pub struct UserRepo {
    pool: SqlitePool,
}

impl UserRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn find_role_by_slug(&self, slug: &str) -> Result<Option<Role>> {
        let row = sqlx::query("SELECT id, slug, name FROM roles WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Role {
            id: r.get("id"),
            slug: r.get("slug"),
            name: r.get("name"),
        }))
    }

    /// Insert the user and its profile inside `tx`.
    #[instrument(skip_all, fields(role = %role.slug))]
    pub async fn create_with_profile(
        tx: &mut Transaction<'_, Sqlite>,
        account: &NewAccount,
        role: &Role,
    ) -> Result<User> {
        let user_id: i64 =
            sqlx::query("INSERT INTO users (email, password, role_id) VALUES (?, ?, ?) RETURNING id")
                .bind(&account.email)
                .bind(&account.password_hash)
                .bind(role.id)
                .fetch_one(&mut **tx)
                .await
                .context("failed to insert user")?
                .get("id");
        let profile_id: i64 = sqlx::query(
            "INSERT INTO profiles (user_id, names, date_of_birth) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(user_id)
        .bind(&account.display_name)
        .bind(account.date_of_birth)
        .fetch_one(&mut **tx)
        .await
        .context("failed to insert profile")?
        .get("id");
        Ok(User {
            id: user_id,
            profile_id,
            role_id: role.id,
            email: account.email.clone(),
            display_name: account.display_name.clone(),
        })
    }

    #[instrument(skip(self))]
    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT u.id, u.email, u.role_id, p.id AS profile_id, p.names \
             FROM users u JOIN profiles p ON p.user_id = u.id WHERE u.email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| User {
            id: r.get("id"),
            profile_id: r.get("profile_id"),
            role_id: r.get("role_id"),
            email: r.get("email"),
            display_name: r.get::<Option<String>, _>("names").unwrap_or_default(),
        }))
    }
}

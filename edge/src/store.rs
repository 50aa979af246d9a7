//! Durable state: subdomain claims, custom domains, and API tokens.
//!
//! Claims and domains are written synchronously on every allocation and
//! release so a restarted edge resumes with the same name mappings. Nothing
//! here mutates in-memory registry state.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use tracing::info;
use uniroute_shared::{Error, Protocol, Result};

/// Persisted subdomain claim.
#[derive(Debug, Clone)]
pub struct ClaimRow {
    pub subdomain: String,
    pub user_id: String,
    pub tunnel_id: String,
    pub protocol: Protocol,
    pub last_used: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Persisted custom domain.
#[derive(Debug, Clone)]
pub struct DomainRow {
    pub id: String,
    pub user_id: String,
    pub hostname: String,
    pub dns_configured: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub tunnel_id: Option<String>,
}

/// Persisted API token, looked up by keyed hash.
#[derive(Debug, Clone)]
pub struct TokenRow {
    pub token_hash: String,
    pub user_id: String,
    pub per_minute_limit: u32,
    pub per_day_limit: u32,
    pub revoked: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| Error::internal(format!("database connect failed: {e}")))?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await
            .map_err(internal)?;

        let store = Self { pool };
        store.initialize_schema().await?;
        info!("state store ready at {}", database_url);
        Ok(store)
    }

    /// In-memory database for tests. Single connection: every `:memory:`
    /// connection is its own database.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(internal)?;
        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subdomain_claims (
                subdomain TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                tunnel_id TEXT NOT NULL,
                protocol TEXT NOT NULL,
                last_used TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS custom_domains (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                hostname TEXT NOT NULL UNIQUE,
                dns_configured INTEGER NOT NULL DEFAULT 0,
                verified_at TEXT,
                tunnel_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_tokens (
                token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                per_minute_limit INTEGER NOT NULL DEFAULT 120,
                per_day_limit INTEGER NOT NULL DEFAULT 10000,
                revoked INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT,
                last_used TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        Ok(())
    }

    // ── Subdomain claims ──

    pub async fn upsert_claim(&self, claim: &ClaimRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subdomain_claims (subdomain, user_id, tunnel_id, protocol, last_used, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(subdomain) DO UPDATE SET
                user_id = excluded.user_id,
                tunnel_id = excluded.tunnel_id,
                protocol = excluded.protocol,
                last_used = excluded.last_used
            "#,
        )
        .bind(&claim.subdomain)
        .bind(&claim.user_id)
        .bind(&claim.tunnel_id)
        .bind(claim.protocol.as_str())
        .bind(claim.last_used.to_rfc3339())
        .bind(claim.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    pub async fn touch_claim(&self, subdomain: &str, last_used: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE subdomain_claims SET last_used = ?1 WHERE subdomain = ?2")
            .bind(last_used.to_rfc3339())
            .bind(subdomain)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    pub async fn delete_claim(&self, subdomain: &str) -> Result<()> {
        sqlx::query("DELETE FROM subdomain_claims WHERE subdomain = ?1")
            .bind(subdomain)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    pub async fn load_claims(&self) -> Result<Vec<ClaimRow>> {
        let rows = sqlx::query("SELECT * FROM subdomain_claims")
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        rows.iter().map(claim_from_row).collect()
    }

    // ── Custom domains ──

    pub async fn insert_domain(&self, domain: &DomainRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO custom_domains (id, user_id, hostname, dns_configured, verified_at, tunnel_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&domain.id)
        .bind(&domain.user_id)
        .bind(&domain.hostname)
        .bind(i64::from(domain.dns_configured))
        .bind(domain.verified_at.map(|t| t.to_rfc3339()))
        .bind(&domain.tunnel_id)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    pub async fn update_domain_verification(
        &self,
        id: &str,
        dns_configured: bool,
        verified_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE custom_domains SET dns_configured = ?1, verified_at = ?2 WHERE id = ?3")
            .bind(i64::from(dns_configured))
            .bind(verified_at.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    pub async fn update_domain_binding(&self, id: &str, tunnel_id: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE custom_domains SET tunnel_id = ?1 WHERE id = ?2")
            .bind(tunnel_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    pub async fn delete_domain(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM custom_domains WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    pub async fn load_domains(&self) -> Result<Vec<DomainRow>> {
        let rows = sqlx::query("SELECT * FROM custom_domains")
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        rows.iter().map(domain_from_row).collect()
    }

    // ── API tokens ──

    pub async fn token_by_hash(&self, token_hash: &str) -> Result<Option<TokenRow>> {
        let row = sqlx::query("SELECT * FROM api_tokens WHERE token_hash = ?1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.as_ref().map(token_from_row).transpose()
    }

    /// Best-effort usage stamp; callers ignore the result.
    pub async fn touch_token(&self, token_hash: &str) -> Result<()> {
        sqlx::query("UPDATE api_tokens SET last_used = ?1 WHERE token_hash = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(token_hash)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    pub async fn insert_token(&self, token: &TokenRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_tokens (token_hash, user_id, per_minute_limit, per_day_limit, revoked, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&token.token_hash)
        .bind(&token.user_id)
        .bind(i64::from(token.per_minute_limit))
        .bind(i64::from(token.per_day_limit))
        .bind(i64::from(token.revoked))
        .bind(token.expires_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }
}

fn internal(e: sqlx::Error) -> Error {
    Error::internal(format!("database error: {e}"))
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::internal(format!("bad timestamp in store: {e}")))
}

fn claim_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ClaimRow> {
    let protocol: String = row.get("protocol");
    Ok(ClaimRow {
        subdomain: row.get("subdomain"),
        user_id: row.get("user_id"),
        tunnel_id: row.get("tunnel_id"),
        protocol: protocol.parse()?,
        last_used: parse_ts(row.get::<String, _>("last_used").as_str())?,
        created_at: parse_ts(row.get::<String, _>("created_at").as_str())?,
    })
}

fn domain_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DomainRow> {
    Ok(DomainRow {
        id: row.get("id"),
        user_id: row.get("user_id"),
        hostname: row.get("hostname"),
        dns_configured: row.get::<i64, _>("dns_configured") != 0,
        verified_at: row
            .get::<Option<String>, _>("verified_at")
            .as_deref()
            .map(parse_ts)
            .transpose()?,
        tunnel_id: row.get("tunnel_id"),
    })
}

fn token_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TokenRow> {
    Ok(TokenRow {
        token_hash: row.get("token_hash"),
        user_id: row.get("user_id"),
        per_minute_limit: row.get::<i64, _>("per_minute_limit") as u32,
        per_day_limit: row.get::<i64, _>("per_day_limit") as u32,
        revoked: row.get::<i64, _>("revoked") != 0,
        expires_at: row
            .get::<Option<String>, _>("expires_at")
            .as_deref()
            .map(parse_ts)
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_round_trip() {
        let store = Store::connect_in_memory().await.unwrap();
        let now = Utc::now();
        let claim = ClaimRow {
            subdomain: "myapp".into(),
            user_id: "u1".into(),
            tunnel_id: "t1".into(),
            protocol: Protocol::Http,
            last_used: now,
            created_at: now,
        };
        store.upsert_claim(&claim).await.unwrap();

        let loaded = store.load_claims().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].subdomain, "myapp");
        assert_eq!(loaded[0].protocol, Protocol::Http);

        store.delete_claim("myapp").await.unwrap();
        assert!(store.load_claims().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_upsert_updates_owner() {
        let store = Store::connect_in_memory().await.unwrap();
        let now = Utc::now();
        let mut claim = ClaimRow {
            subdomain: "shared".into(),
            user_id: "u1".into(),
            tunnel_id: "t1".into(),
            protocol: Protocol::Http,
            last_used: now,
            created_at: now,
        };
        store.upsert_claim(&claim).await.unwrap();

        claim.user_id = "u2".into();
        claim.protocol = Protocol::Tcp;
        store.upsert_claim(&claim).await.unwrap();

        let loaded = store.load_claims().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].user_id, "u2");
        assert_eq!(loaded[0].protocol, Protocol::Tcp);
    }

    #[tokio::test]
    async fn test_domain_unique_hostname() {
        let store = Store::connect_in_memory().await.unwrap();
        let domain = DomainRow {
            id: "d1".into(),
            user_id: "u1".into(),
            hostname: "app.example.net".into(),
            dns_configured: false,
            verified_at: None,
            tunnel_id: None,
        };
        store.insert_domain(&domain).await.unwrap();

        let dup = DomainRow {
            id: "d2".into(),
            ..domain.clone()
        };
        assert!(store.insert_domain(&dup).await.is_err());
    }

    #[tokio::test]
    async fn test_token_lookup() {
        let store = Store::connect_in_memory().await.unwrap();
        store
            .insert_token(&TokenRow {
                token_hash: "abc".into(),
                user_id: "u1".into(),
                per_minute_limit: 60,
                per_day_limit: 1000,
                revoked: false,
                expires_at: None,
            })
            .await
            .unwrap();

        let found = store.token_by_hash("abc").await.unwrap().unwrap();
        assert_eq!(found.user_id, "u1");
        assert!(store.token_by_hash("missing").await.unwrap().is_none());
        store.touch_token("abc").await.unwrap();
    }
}

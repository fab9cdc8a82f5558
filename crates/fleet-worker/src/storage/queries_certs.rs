//! Certificate bookkeeping.
//!
//! At most one agent certificate per agent is active: recording a new one
//! revokes its predecessors in the same transaction.

use fleet_core::db::unix_timestamp;

use super::db::{DatabaseError, WorkerDatabase};
use super::models::{CertificateRecord, CertificateType, Revocation};

/// RFC 5280 `CRLReason` for a certificate replaced by a newer one.
const REASON_SUPERSEDED: i64 = 4;

/// Parameters for recording an issued certificate.
pub struct NewCertificate<'a> {
    pub serial: &'a str,
    pub cert_type: CertificateType,
    pub uid: &'a str,
    pub description: &'a str,
    pub expiry: i64,
}

impl WorkerDatabase {
    /// Look up a certificate by its serial number.
    pub async fn get_certificate(
        &self,
        serial: &str,
    ) -> Result<Option<CertificateRecord>, DatabaseError> {
        let cert =
            sqlx::query_as::<_, CertificateRecord>("SELECT * FROM certificates WHERE serial = ?")
                .bind(serial)
                .fetch_optional(self.pool())
                .await?;
        Ok(cert)
    }

    /// Every certificate of one owner, newest first.
    pub async fn certificates_for(
        &self,
        cert_type: CertificateType,
        uid: &str,
    ) -> Result<Vec<CertificateRecord>, DatabaseError> {
        let certs = sqlx::query_as::<_, CertificateRecord>(
            "SELECT * FROM certificates WHERE cert_type = ? AND uid = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(cert_type.as_str())
        .bind(uid)
        .fetch_all(self.pool())
        .await?;
        Ok(certs)
    }

    /// Revoke every active agent certificate of `cert.uid`, then record
    /// `cert`. Returns the serials that were revoked.
    pub async fn rotate_agent_certificate(
        &self,
        cert: &NewCertificate<'_>,
    ) -> Result<Vec<String>, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        let previous: Vec<(String, i64)> = sqlx::query_as(
            "SELECT serial, expiry FROM certificates WHERE cert_type = 'agent' AND uid = ? AND revoked = 0",
        )
        .bind(cert.uid)
        .fetch_all(&mut *tx)
        .await?;

        for (serial, expiry) in &previous {
            sqlx::query("UPDATE certificates SET revoked = 1 WHERE serial = ?")
                .bind(serial)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                r"
                INSERT INTO revocations (serial, reason, info, expiry, revoked_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(serial) DO NOTHING
                ",
            )
            .bind(serial)
            .bind(REASON_SUPERSEDED)
            .bind(format!("superseded by {}", cert.serial))
            .bind(expiry)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        insert_certificate(&mut tx, cert, now).await?;

        tx.commit().await?;
        Ok(previous.into_iter().map(|(serial, _)| serial).collect())
    }

    /// Record a user certificate and mark its owner as served: certificate
    /// sent and e-mail verified.
    pub async fn record_user_certificate(
        &self,
        cert: &NewCertificate<'_>,
        email: &str,
        full_name: &str,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        insert_certificate(&mut tx, cert, now).await?;

        sqlx::query(
            r"
            INSERT INTO users (id, name, email, email_verified, cert_sent, created_at)
            VALUES (?, ?, ?, 1, 1, ?)
            ON CONFLICT(id) DO UPDATE SET email_verified = 1, cert_sent = 1
            ",
        )
        .bind(cert.uid)
        .bind(full_name)
        .bind(email)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Mark a certificate revoked and keep a revocation entry.
    ///
    /// Returns `false` when the serial is unknown.
    pub async fn revoke_certificate(
        &self,
        serial: &str,
        reason: i64,
        info: &str,
    ) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let expiry: Option<(i64,)> =
            sqlx::query_as("SELECT expiry FROM certificates WHERE serial = ?")
                .bind(serial)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((expiry,)) = expiry else {
            return Ok(false);
        };

        sqlx::query("UPDATE certificates SET revoked = 1 WHERE serial = ?")
            .bind(serial)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r"
            INSERT INTO revocations (serial, reason, info, expiry, revoked_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(serial) DO UPDATE SET reason = excluded.reason, info = excluded.info
            ",
        )
        .bind(serial)
        .bind(reason)
        .bind(info)
        .bind(expiry)
        .bind(unix_timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_revocation(&self, serial: &str) -> Result<Option<Revocation>, DatabaseError> {
        let revocation =
            sqlx::query_as::<_, Revocation>("SELECT * FROM revocations WHERE serial = ?")
                .bind(serial)
                .fetch_optional(self.pool())
                .await?;
        Ok(revocation)
    }
}

async fn insert_certificate(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    cert: &NewCertificate<'_>,
    now: i64,
) -> Result<(), DatabaseError> {
    sqlx::query(
        r"
        INSERT INTO certificates (serial, cert_type, uid, description, expiry, revoked, created_at)
        VALUES (?, ?, ?, ?, ?, 0, ?)
        ",
    )
    .bind(cert.serial)
    .bind(cert.cert_type.as_str())
    .bind(cert.uid)
    .bind(cert.description)
    .bind(cert.expiry)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::needless_pass_by_value
)]
mod tests {
    use super::*;

    fn agent_cert<'a>(serial: &'a str, uid: &'a str) -> NewCertificate<'a> {
        NewCertificate {
            serial,
            cert_type: CertificateType::Agent,
            uid,
            description: "agent-7.fleet.test agent certificate",
            expiry: 2_000_000_000,
        }
    }

    #[tokio::test]
    async fn rotation_leaves_one_active_certificate() {
        let db = WorkerDatabase::open_in_memory().await.unwrap();

        let revoked = db
            .rotate_agent_certificate(&agent_cert("100", "agent-7"))
            .await
            .unwrap();
        assert!(revoked.is_empty());

        let revoked = db
            .rotate_agent_certificate(&agent_cert("200", "agent-7"))
            .await
            .unwrap();
        assert_eq!(revoked, vec!["100".to_string()]);

        let certs = db
            .certificates_for(CertificateType::Agent, "agent-7")
            .await
            .unwrap();
        let active: Vec<_> = certs.iter().filter(|c| !c.revoked).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].serial, "200");

        let revocation = db.get_revocation("100").await.unwrap().unwrap();
        assert_eq!(revocation.reason, REASON_SUPERSEDED);
        assert!(revocation.info.contains("200"));
    }

    #[tokio::test]
    async fn rotation_does_not_touch_other_agents() {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        db.rotate_agent_certificate(&agent_cert("1", "agent-1"))
            .await
            .unwrap();
        db.rotate_agent_certificate(&agent_cert("2", "agent-2"))
            .await
            .unwrap();

        let cert = db.get_certificate("1").await.unwrap().unwrap();
        assert!(!cert.revoked);
    }

    #[tokio::test]
    async fn duplicate_serial_rolls_back_revocations() {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        db.rotate_agent_certificate(&agent_cert("1", "agent-1"))
            .await
            .unwrap();

        // Same serial again: the insert fails, so the revocation of "1" must not stick.
        assert!(db
            .rotate_agent_certificate(&agent_cert("1", "agent-1"))
            .await
            .is_err());
        let cert = db.get_certificate("1").await.unwrap().unwrap();
        assert!(!cert.revoked);
    }

    #[tokio::test]
    async fn user_certificate_marks_user_served() {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        let cert = NewCertificate {
            serial: "42",
            cert_type: CertificateType::User,
            uid: "alice",
            description: "alice client certificate",
            expiry: 2_000_000_000,
        };
        db.record_user_certificate(&cert, "alice@example.com", "Alice")
            .await
            .unwrap();

        let user = db.get_user("alice").await.unwrap().unwrap();
        assert!(user.email_verified);
        assert!(user.cert_sent);
        assert_eq!(user.email, "alice@example.com");
    }

    #[tokio::test]
    async fn revoke_unknown_serial_returns_false() {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        assert!(!db.revoke_certificate("nope", 0, "").await.unwrap());
    }

    #[tokio::test]
    async fn revoke_is_repeatable() {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        db.rotate_agent_certificate(&agent_cert("9", "agent-9"))
            .await
            .unwrap();
        assert!(db.revoke_certificate("9", 1, "key compromise").await.unwrap());
        assert!(db.revoke_certificate("9", 1, "key compromise").await.unwrap());
        assert!(db.get_certificate("9").await.unwrap().unwrap().revoked);
    }
}

//! Settings, users and server identity.

use fleet_core::db::unix_timestamp;

use super::db::{DatabaseError, WorkerDatabase};
use super::models::{ServerIdentity, Settings, User};

impl WorkerDatabase {
    /// Read the global settings row.
    pub async fn get_settings(&self) -> Result<Settings, DatabaseError> {
        let settings = sqlx::query_as::<_, Settings>("SELECT * FROM settings WHERE id = 1")
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound("Settings".to_string()))?;
        Ok(settings)
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO settings (
                id, auto_admit_agents, agent_report_frequency_mins, smtp_server, smtp_port,
                smtp_user, smtp_password, smtp_auth, smtp_tls, message_from
            )
            VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                auto_admit_agents = excluded.auto_admit_agents,
                agent_report_frequency_mins = excluded.agent_report_frequency_mins,
                smtp_server = excluded.smtp_server,
                smtp_port = excluded.smtp_port,
                smtp_user = excluded.smtp_user,
                smtp_password = excluded.smtp_password,
                smtp_auth = excluded.smtp_auth,
                smtp_tls = excluded.smtp_tls,
                message_from = excluded.message_from
            ",
        )
        .bind(settings.auto_admit_agents)
        .bind(settings.agent_report_frequency_mins)
        .bind(&settings.smtp_server)
        .bind(settings.smtp_port)
        .bind(&settings.smtp_user)
        .bind(&settings.smtp_password)
        .bind(&settings.smtp_auth)
        .bind(settings.smtp_tls)
        .bind(&settings.message_from)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>, DatabaseError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(user)
    }

    /// Record (or refresh) the identity of a running worker.
    pub async fn record_server(&self, server: &ServerIdentity) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO servers (hostname, arch, os, version, channel, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(hostname) DO UPDATE SET
                arch = excluded.arch,
                os = excluded.os,
                version = excluded.version,
                channel = excluded.channel,
                updated_at = excluded.updated_at
            ",
        )
        .bind(&server.hostname)
        .bind(&server.arch)
        .bind(&server.os)
        .bind(&server.version)
        .bind(&server.channel)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_server(
        &self,
        hostname: &str,
    ) -> Result<Option<ServerIdentity>, DatabaseError> {
        let server = sqlx::query_as::<_, ServerIdentity>(
            "SELECT hostname, arch, os, version, channel FROM servers WHERE hostname = ?",
        )
        .bind(hostname)
        .fetch_optional(self.pool())
        .await?;
        Ok(server)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_settings_have_defaults() {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        let settings = db.get_settings().await.unwrap();
        assert!(!settings.auto_admit_agents);
        assert_eq!(settings.agent_report_frequency_mins, 60);
        assert_eq!(settings.smtp_port, 587);
    }

    #[tokio::test]
    async fn save_settings_round_trip() {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        let mut settings = db.get_settings().await.unwrap();
        settings.auto_admit_agents = true;
        settings.message_from = "fleet@example.com".into();
        db.save_settings(&settings).await.unwrap();

        assert_eq!(db.get_settings().await.unwrap(), settings);
    }

    #[tokio::test]
    async fn record_server_refreshes_existing_entry() {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        let mut server = ServerIdentity::current("worker-1");
        db.record_server(&server).await.unwrap();

        server.version = "9.9.9".into();
        db.record_server(&server).await.unwrap();

        let stored = db.get_server("worker-1").await.unwrap().unwrap();
        assert_eq!(stored.version, "9.9.9");
    }
}

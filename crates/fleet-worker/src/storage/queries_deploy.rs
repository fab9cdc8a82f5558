//! Deployment result queries.

use super::db::{DatabaseError, WorkerDatabase};
use super::models::Deployment;

impl WorkerDatabase {
    /// Record a successful install at `when`, replacing any previous entry
    /// for the same package.
    pub async fn record_install(
        &self,
        agent_id: &str,
        package_id: &str,
        name: &str,
        version: &str,
        when: i64,
        by_profile: bool,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO deployments
                (agent_id, package_id, name, version, installed, updated, by_profile)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(agent_id, package_id) DO UPDATE SET
                name = excluded.name,
                version = excluded.version,
                installed = excluded.installed,
                updated = excluded.updated,
                by_profile = excluded.by_profile
            ",
        )
        .bind(agent_id)
        .bind(package_id)
        .bind(name)
        .bind(version)
        .bind(when)
        .bind(when)
        .bind(by_profile)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record the time an installed package was last updated. Updating a
    /// package that was never recorded as installed is a no-op; returns
    /// whether a deployment was touched.
    pub async fn record_update(
        &self,
        agent_id: &str,
        package_id: &str,
        when: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE deployments SET updated = ? WHERE agent_id = ? AND package_id = ?",
        )
        .bind(when)
        .bind(agent_id)
        .bind(package_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Forget an uninstalled package. Removing an unknown package is a no-op.
    pub async fn record_uninstall(
        &self,
        agent_id: &str,
        package_id: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM deployments WHERE agent_id = ? AND package_id = ?")
            .bind(agent_id)
            .bind(package_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn list_deployments(&self, agent_id: &str) -> Result<Vec<Deployment>, DatabaseError> {
        let deployments = sqlx::query_as::<_, Deployment>(
            "SELECT * FROM deployments WHERE agent_id = ? ORDER BY package_id",
        )
        .bind(agent_id)
        .fetch_all(self.pool())
        .await?;
        Ok(deployments)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::{Agent, AgentStatus};

    async fn db_with_agent() -> WorkerDatabase {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        db.upsert_agent_with("A1", |_| Agent::first_seen("A1", AgentStatus::Enabled, 1))
            .await
            .unwrap();
        db
    }

    #[tokio::test]
    async fn install_update_uninstall() {
        let db = db_with_agent().await;

        db.record_install("A1", "Mozilla.Firefox", "Firefox", "120.0", 1_000, false)
            .await
            .unwrap();
        db.record_install("A1", "Mozilla.Firefox", "Firefox", "120.0", 1_000, false)
            .await
            .unwrap();
        assert_eq!(db.list_deployments("A1").await.unwrap().len(), 1);

        assert!(db.record_update("A1", "Mozilla.Firefox", 2_000).await.unwrap());
        let deployments = db.list_deployments("A1").await.unwrap();
        assert_eq!(deployments[0].installed, 1_000);
        assert_eq!(deployments[0].updated, 2_000);

        db.record_uninstall("A1", "Mozilla.Firefox").await.unwrap();
        assert!(db.list_deployments("A1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_of_unknown_package_touches_nothing() {
        let db = db_with_agent().await;
        assert!(!db.record_update("A1", "missing", 5).await.unwrap());
        assert!(db.list_deployments("A1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn install_for_unknown_agent_fails() {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        assert!(db.record_install("ghost", "p", "p", "1", 1, false).await.is_err());
    }
}

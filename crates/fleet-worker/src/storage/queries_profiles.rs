//! WinGet configuration profile results: package exclusions and per-agent
//! profile issues.

use fleet_core::db::unix_timestamp;

use super::db::{DatabaseError, WorkerDatabase};
use super::models::{PackageExclusion, ProfileIssue};

impl WorkerDatabase {
    /// Remember that `package_id` must not be deployed to the agent again.
    pub async fn record_exclusion(
        &self,
        agent_id: &str,
        package_id: &str,
        when: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO package_exclusions (agent_id, package_id, excluded_at)
            VALUES (?, ?, ?)
            ON CONFLICT(agent_id, package_id) DO NOTHING
            ",
        )
        .bind(agent_id)
        .bind(package_id)
        .bind(when)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_exclusions(
        &self,
        agent_id: &str,
    ) -> Result<Vec<PackageExclusion>, DatabaseError> {
        let exclusions = sqlx::query_as::<_, PackageExclusion>(
            "SELECT * FROM package_exclusions WHERE agent_id = ? ORDER BY package_id",
        )
        .bind(agent_id)
        .fetch_all(self.pool())
        .await?;
        Ok(exclusions)
    }

    /// Store the outcome of applying a profile. A failure creates or
    /// refreshes the agent's issue for that profile; a success clears it.
    pub async fn record_profile_result(
        &self,
        profile_id: i64,
        agent_id: &str,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        match error {
            Some(error) => {
                sqlx::query(
                    r"
                    INSERT INTO profile_issues (profile_id, agent_id, error, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(profile_id, agent_id) DO UPDATE SET
                        error = excluded.error,
                        updated_at = excluded.updated_at
                    ",
                )
                .bind(profile_id)
                .bind(agent_id)
                .bind(error)
                .bind(unix_timestamp())
                .execute(self.pool())
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM profile_issues WHERE profile_id = ? AND agent_id = ?")
                    .bind(profile_id)
                    .bind(agent_id)
                    .execute(self.pool())
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn list_profile_issues(
        &self,
        agent_id: &str,
    ) -> Result<Vec<ProfileIssue>, DatabaseError> {
        let issues = sqlx::query_as::<_, ProfileIssue>(
            "SELECT * FROM profile_issues WHERE agent_id = ? ORDER BY profile_id",
        )
        .bind(agent_id)
        .fetch_all(self.pool())
        .await?;
        Ok(issues)
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
    async fn exclusions_are_recorded_once() {
        let db = db_with_agent().await;
        db.record_exclusion("A1", "Mozilla.Firefox", 10).await.unwrap();
        db.record_exclusion("A1", "Mozilla.Firefox", 20).await.unwrap();

        let exclusions = db.list_exclusions("A1").await.unwrap();
        assert_eq!(exclusions.len(), 1);
        assert_eq!(exclusions[0].excluded_at, 10);
    }

    #[tokio::test]
    async fn failure_is_refreshed_then_cleared_by_success() {
        let db = db_with_agent().await;
        db.record_profile_result(3, "A1", Some("package not found"))
            .await
            .unwrap();
        db.record_profile_result(3, "A1", Some("hash mismatch"))
            .await
            .unwrap();

        let issues = db.list_profile_issues("A1").await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].error, "hash mismatch");

        db.record_profile_result(3, "A1", None).await.unwrap();
        assert!(db.list_profile_issues("A1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn success_without_issue_is_a_no_op() {
        let db = db_with_agent().await;
        db.record_profile_result(9, "A1", None).await.unwrap();
        assert!(db.list_profile_issues("A1").await.unwrap().is_empty());
    }
}

//! Agent record queries.

use super::db::{DatabaseError, WorkerDatabase};
use super::models::{Agent, AgentStatus};

impl WorkerDatabase {
    /// Get an agent by ID.
    pub async fn get_agent(&self, id: &str) -> Result<Option<Agent>, DatabaseError> {
        let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(agent)
    }

    /// Read-modify-write of one agent inside a single transaction.
    ///
    /// `reconcile` receives the stored record (if any) and returns the record
    /// to persist. Administrative columns (`nickname`, `description`) are
    /// never written here, whatever `reconcile` returns.
    pub async fn upsert_agent_with<F>(&self, id: &str, reconcile: F) -> Result<Agent, DatabaseError>
    where
        F: FnOnce(Option<Agent>) -> Agent + Send,
    {
        let mut tx = self.pool().begin().await?;

        let existing = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let agent = reconcile(existing);

        sqlx::query(
            r"
            INSERT INTO agents (
                id, os, hostname, ip_address, mac_address, vnc_proxy_port, sftp_port,
                certificate_ready, sftp_service, remote_assistance, debug_mode, is_remote,
                agent_status, first_contact, last_contact,
                update_task_description, update_task_status, update_task_result,
                update_task_execution, update_task_version
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                os = excluded.os,
                hostname = excluded.hostname,
                ip_address = excluded.ip_address,
                mac_address = excluded.mac_address,
                vnc_proxy_port = excluded.vnc_proxy_port,
                sftp_port = excluded.sftp_port,
                certificate_ready = excluded.certificate_ready,
                sftp_service = excluded.sftp_service,
                remote_assistance = excluded.remote_assistance,
                debug_mode = excluded.debug_mode,
                is_remote = excluded.is_remote,
                agent_status = excluded.agent_status,
                last_contact = excluded.last_contact,
                update_task_description = excluded.update_task_description,
                update_task_status = excluded.update_task_status,
                update_task_result = excluded.update_task_result,
                update_task_execution = excluded.update_task_execution,
                update_task_version = excluded.update_task_version
            ",
        )
        .bind(&agent.id)
        .bind(&agent.os)
        .bind(&agent.hostname)
        .bind(&agent.ip_address)
        .bind(&agent.mac_address)
        .bind(&agent.vnc_proxy_port)
        .bind(&agent.sftp_port)
        .bind(agent.certificate_ready)
        .bind(agent.sftp_service)
        .bind(agent.remote_assistance)
        .bind(agent.debug_mode)
        .bind(agent.is_remote)
        .bind(&agent.agent_status)
        .bind(agent.first_contact)
        .bind(agent.last_contact)
        .bind(&agent.update_task_description)
        .bind(&agent.update_task_status)
        .bind(&agent.update_task_result)
        .bind(agent.update_task_execution)
        .bind(&agent.update_task_version)
        .execute(&mut *tx)
        .await?;

        let stored = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(stored)
    }

    /// Administrative status change (admission, enable, disable).
    pub async fn set_agent_status(
        &self,
        id: &str,
        status: AgentStatus,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE agents SET agent_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Agent {id}")));
        }
        Ok(())
    }

    /// Administrative request to update an agent to `version`.
    pub async fn schedule_agent_update(
        &self,
        id: &str,
        version: &str,
        description: &str,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE agents SET update_task_version = ?, update_task_description = ? WHERE id = ?",
        )
        .bind(version)
        .bind(description)
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Agent {id}")));
        }
        Ok(())
    }
}

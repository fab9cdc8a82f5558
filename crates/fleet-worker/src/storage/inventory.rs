//! Generic persistence for per-agent inventory.
//!
//! Every inventory table is keyed by `agent_id`. Single-valued sections are
//! upserted on that key; collections are replaced wholesale. Both operations
//! are written once and parameterised by [`ChildRecord`].

use sqlx::query_builder::Separated;
use sqlx::{QueryBuilder, Sqlite};

use super::db::{DatabaseError, WorkerDatabase};
use super::models::{
    Antivirus, App, Computer, LogicalDisk, MemorySlot, Monitor, NetworkAdapter, OperatingSystem,
    Printer, Release, Share, SystemUpdate, Update,
};

/// Rows per multi-row `INSERT`, far below `SQLite`'s bind-parameter limit.
pub const INSERT_CHUNK_ROWS: usize = 100;

/// A row type stored in an `agent_id`-keyed inventory table.
pub trait ChildRecord: Send + Sync {
    const TABLE: &'static str;
    /// Columns written by [`ChildRecord::push_values`], in order, without `agent_id`.
    const COLUMNS: &'static [&'static str];

    fn push_values(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>);
}

impl WorkerDatabase {
    /// Replace every `C` row of `agent_id` with `children`.
    ///
    /// Delete and insert share one transaction, so a failure leaves the
    /// previous rows in place and a retry with the same input converges to
    /// the same state.
    pub async fn replace_children<C: ChildRecord>(
        &self,
        agent_id: &str,
        children: &[C],
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let delete = format!("DELETE FROM {} WHERE agent_id = ?", C::TABLE);
        sqlx::query(&delete)
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;

        for chunk in children.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
                "INSERT INTO {} (agent_id, {}) ",
                C::TABLE,
                C::COLUMNS.join(", ")
            ));
            builder.push_values(chunk, |mut row, child| {
                row.push_bind(agent_id.to_string());
                child.push_values(&mut row);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Insert or overwrite the single `C` row of `agent_id`.
    pub async fn upsert_section<C: ChildRecord>(
        &self,
        agent_id: &str,
        section: &C,
    ) -> Result<(), DatabaseError> {
        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {} (agent_id, {}) ",
            C::TABLE,
            C::COLUMNS.join(", ")
        ));
        builder.push_values(std::iter::once(section), |mut row, section| {
            row.push_bind(agent_id.to_string());
            section.push_values(&mut row);
        });
        let assignments = C::COLUMNS
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        builder.push(format!(" ON CONFLICT(agent_id) DO UPDATE SET {assignments}"));

        builder.build().execute(self.pool()).await?;
        Ok(())
    }

    /// Number of `C` rows stored for `agent_id`.
    pub async fn count_children<C: ChildRecord>(
        &self,
        agent_id: &str,
    ) -> Result<i64, DatabaseError> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE agent_id = ?", C::TABLE);
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(agent_id)
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Installed applications of an agent, ordered by name.
    pub async fn list_apps(&self, agent_id: &str) -> Result<Vec<App>, DatabaseError> {
        let apps = sqlx::query_as::<_, App>(
            "SELECT name, version, publisher, install_date FROM apps WHERE agent_id = ? ORDER BY name",
        )
        .bind(agent_id)
        .fetch_all(self.pool())
        .await?;
        Ok(apps)
    }

    /// Record the agent's release and link the agent to it.
    pub async fn link_release(
        &self,
        agent_id: &str,
        release: &Release,
    ) -> Result<i64, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r"
            INSERT INTO releases (release_type, version, channel, os, arch)
            VALUES ('agent', ?, ?, ?, ?)
            ON CONFLICT(release_type, version, channel, os, arch) DO NOTHING
            ",
        )
        .bind(&release.version)
        .bind(&release.channel)
        .bind(&release.os)
        .bind(&release.arch)
        .execute(&mut *tx)
        .await?;

        let (release_id,): (i64,) = sqlx::query_as(
            r"
            SELECT id FROM releases
            WHERE release_type = 'agent' AND version = ? AND channel = ? AND os = ? AND arch = ?
            ",
        )
        .bind(&release.version)
        .bind(&release.channel)
        .bind(&release.os)
        .bind(&release.arch)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE agents SET release_id = ? WHERE id = ?")
            .bind(release_id)
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(release_id)
    }
}

fn timestamp(t: Option<chrono::DateTime<chrono::Utc>>) -> Option<i64> {
    t.map(|t| t.timestamp())
}

impl ChildRecord for Computer {
    const TABLE: &'static str = "computers";
    const COLUMNS: &'static [&'static str] = &[
        "manufacturer",
        "model",
        "serial",
        "memory",
        "processor",
        "processor_arch",
        "processor_cores",
    ];

    fn push_values(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.manufacturer.clone())
            .push_bind(self.model.clone())
            .push_bind(self.serial.clone())
            .push_bind(self.memory)
            .push_bind(self.processor.clone())
            .push_bind(self.processor_arch.clone())
            .push_bind(self.processor_cores);
    }
}

impl ChildRecord for OperatingSystem {
    const TABLE: &'static str = "operating_systems";
    const COLUMNS: &'static [&'static str] = &[
        "os_type",
        "version",
        "description",
        "edition",
        "install_date",
        "arch",
        "username",
        "last_bootup_time",
    ];

    fn push_values(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.os_type.clone())
            .push_bind(self.version.clone())
            .push_bind(self.description.clone())
            .push_bind(self.edition.clone())
            .push_bind(timestamp(self.install_date))
            .push_bind(self.arch.clone())
            .push_bind(self.username.clone())
            .push_bind(timestamp(self.last_bootup_time));
    }
}

impl ChildRecord for Antivirus {
    const TABLE: &'static str = "antiviri";
    const COLUMNS: &'static [&'static str] = &["name", "is_active", "is_updated"];

    fn push_values(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.name.clone())
            .push_bind(self.is_active)
            .push_bind(self.is_updated);
    }
}

impl ChildRecord for SystemUpdate {
    const TABLE: &'static str = "system_updates";
    const COLUMNS: &'static [&'static str] =
        &["status", "last_install", "last_search", "pending_updates"];

    fn push_values(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.status.clone())
            .push_bind(timestamp(self.last_install))
            .push_bind(timestamp(self.last_search))
            .push_bind(self.pending_updates);
    }
}

impl ChildRecord for App {
    const TABLE: &'static str = "apps";
    const COLUMNS: &'static [&'static str] = &["name", "version", "publisher", "install_date"];

    fn push_values(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.name.clone())
            .push_bind(self.version.clone())
            .push_bind(self.publisher.clone())
            .push_bind(self.install_date.clone());
    }
}

impl ChildRecord for Monitor {
    const TABLE: &'static str = "monitors";
    const COLUMNS: &'static [&'static str] = &[
        "manufacturer",
        "model",
        "serial",
        "week_of_manufacture",
        "year_of_manufacture",
    ];

    fn push_values(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.manufacturer.clone())
            .push_bind(self.model.clone())
            .push_bind(self.serial.clone())
            .push_bind(self.week_of_manufacture.clone())
            .push_bind(self.year_of_manufacture.clone());
    }
}

impl ChildRecord for MemorySlot {
    const TABLE: &'static str = "memory_slots";
    const COLUMNS: &'static [&'static str] = &[
        "slot",
        "size",
        "memory_type",
        "serial_number",
        "part_number",
        "speed",
    ];

    fn push_values(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.slot.clone())
            .push_bind(self.size.clone())
            .push_bind(self.memory_type.clone())
            .push_bind(self.serial_number.clone())
            .push_bind(self.part_number.clone())
            .push_bind(self.speed.clone());
    }
}

impl ChildRecord for LogicalDisk {
    const TABLE: &'static str = "logical_disks";
    const COLUMNS: &'static [&'static str] = &[
        "label",
        "usage",
        "filesystem",
        "size_in_units",
        "remaining_space_in_units",
        "volume_name",
        "bitlocker_status",
    ];

    fn push_values(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.label.clone())
            .push_bind(self.usage)
            .push_bind(self.filesystem.clone())
            .push_bind(self.size_in_units.clone())
            .push_bind(self.remaining_space_in_units.clone())
            .push_bind(self.volume_name.clone())
            .push_bind(self.bitlocker_status.clone());
    }
}

impl ChildRecord for Printer {
    const TABLE: &'static str = "printers";
    const COLUMNS: &'static [&'static str] =
        &["name", "port", "is_default", "is_network", "is_shared"];

    fn push_values(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.name.clone())
            .push_bind(self.port.clone())
            .push_bind(self.is_default)
            .push_bind(self.is_network)
            .push_bind(self.is_shared);
    }
}

impl ChildRecord for NetworkAdapter {
    const TABLE: &'static str = "network_adapters";
    const COLUMNS: &'static [&'static str] = &[
        "name",
        "mac_address",
        "addresses",
        "subnet",
        "default_gateway",
        "dns_servers",
        "dns_domain",
        "dhcp_enabled",
        "dhcp_lease_obtained",
        "dhcp_lease_expired",
        "speed",
    ];

    fn push_values(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.name.clone())
            .push_bind(self.mac_address.clone())
            .push_bind(self.addresses.clone())
            .push_bind(self.subnet.clone())
            .push_bind(self.default_gateway.clone())
            .push_bind(self.dns_servers.clone())
            .push_bind(self.dns_domain.clone())
            .push_bind(self.dhcp_enabled)
            .push_bind(timestamp(self.dhcp_lease_obtained))
            .push_bind(timestamp(self.dhcp_lease_expired))
            .push_bind(self.speed.clone());
    }
}

impl ChildRecord for Share {
    const TABLE: &'static str = "shares";
    const COLUMNS: &'static [&'static str] = &["name", "description", "path"];

    fn push_values(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.name.clone())
            .push_bind(self.description.clone())
            .push_bind(self.path.clone());
    }
}

impl ChildRecord for Update {
    const TABLE: &'static str = "updates";
    const COLUMNS: &'static [&'static str] = &["title", "installed_at", "support_url"];

    fn push_values(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.title.clone())
            .push_bind(timestamp(self.installed_at))
            .push_bind(self.support_url.clone());
    }
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
    use crate::storage::{Agent, AgentStatus};

    async fn test_db() -> WorkerDatabase {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        db.upsert_agent_with("A1", |_| Agent::first_seen("A1", AgentStatus::Enabled, 1000))
            .await
            .unwrap();
        db
    }

    fn app(name: &str) -> App {
        App {
            name: name.into(),
            version: "1.0".into(),
            publisher: "ACME".into(),
            install_date: "2024-01-01".into(),
        }
    }

    #[tokio::test]
    async fn replace_children_is_idempotent() {
        let db = test_db().await;
        let apps = vec![app("a"), app("b"), app("c")];

        db.replace_children("A1", &apps).await.unwrap();
        db.replace_children("A1", &apps).await.unwrap();

        assert_eq!(db.list_apps("A1").await.unwrap(), apps);
    }

    #[tokio::test]
    async fn replace_children_drops_stale_rows() {
        let db = test_db().await;
        db.replace_children("A1", &[app("a"), app("b"), app("c")])
            .await
            .unwrap();
        db.replace_children("A1", &[app("z")]).await.unwrap();

        let apps = db.list_apps("A1").await.unwrap();
        assert_eq!(apps, vec![app("z")]);
    }

    #[tokio::test]
    async fn replace_children_with_empty_set_clears_collection() {
        let db = test_db().await;
        db.replace_children("A1", &[Printer::default()]).await.unwrap();
        db.replace_children::<Printer>("A1", &[]).await.unwrap();
        assert_eq!(db.count_children::<Printer>("A1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replace_children_spans_multiple_chunks() {
        let db = test_db().await;
        let apps: Vec<App> = (0..INSERT_CHUNK_ROWS * 2 + 7)
            .map(|i| app(&format!("app-{i:04}")))
            .collect();
        db.replace_children("A1", &apps).await.unwrap();
        assert_eq!(
            db.count_children::<App>("A1").await.unwrap(),
            i64::try_from(apps.len()).unwrap()
        );
    }

    /// Writes NULL into a NOT NULL column so the insert half fails.
    struct BrokenApp;

    impl ChildRecord for BrokenApp {
        const TABLE: &'static str = "apps";
        const COLUMNS: &'static [&'static str] = &["name", "version", "publisher", "install_date"];

        fn push_values(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
            row.push_bind(Option::<String>::None)
                .push_bind("1.0")
                .push_bind("ACME")
                .push_bind("2024-01-01");
        }
    }

    #[tokio::test]
    async fn failed_replace_keeps_previous_children() {
        let db = test_db().await;
        db.replace_children("A1", &[app("kept")]).await.unwrap();

        let err = db.replace_children("A1", &[BrokenApp]).await;
        assert!(err.is_err());
        assert_eq!(db.list_apps("A1").await.unwrap(), vec![app("kept")]);
    }

    #[tokio::test]
    async fn children_of_unknown_agents_are_rejected() {
        let db = test_db().await;
        assert!(db.replace_children("ghost", &[app("x")]).await.is_err());
    }

    #[tokio::test]
    async fn children_are_scoped_per_agent() {
        let db = test_db().await;
        db.upsert_agent_with("A2", |_| Agent::first_seen("A2", AgentStatus::Enabled, 1000))
            .await
            .unwrap();
        db.replace_children("A1", &[app("one")]).await.unwrap();
        db.replace_children("A2", &[app("two"), app("three")])
            .await
            .unwrap();
        db.replace_children::<App>("A2", &[]).await.unwrap();

        assert_eq!(db.list_apps("A1").await.unwrap(), vec![app("one")]);
    }

    #[tokio::test]
    async fn upsert_section_overwrites_single_row() {
        let db = test_db().await;
        let mut av = Antivirus {
            name: "Defender".into(),
            is_active: true,
            is_updated: false,
        };
        db.upsert_section("A1", &av).await.unwrap();
        av.is_updated = true;
        db.upsert_section("A1", &av).await.unwrap();

        assert_eq!(db.count_children::<Antivirus>("A1").await.unwrap(), 1);
        let (updated,): (bool,) =
            sqlx::query_as("SELECT is_updated FROM antiviri WHERE agent_id = 'A1'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert!(updated);
    }

    #[tokio::test]
    async fn link_release_reuses_existing_release() {
        let db = test_db().await;
        let release = Release {
            version: "0.5.0".into(),
            channel: "stable".into(),
            os: "windows".into(),
            arch: "amd64".into(),
        };
        let first = db.link_release("A1", &release).await.unwrap();
        let second = db.link_release("A1", &release).await.unwrap();
        assert_eq!(first, second);

        let agent = db.get_agent("A1").await.unwrap().unwrap();
        assert_eq!(agent.release_id, Some(first));
    }
}

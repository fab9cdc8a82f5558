//! Database connection and initialization.

pub use fleet_core::db::DatabaseError;

fleet_core::define_database!(WorkerDatabase, "Worker database migrations complete");

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = WorkerDatabase::open_in_memory().await;
        assert!(db.is_ok());
    }
}

use async_relay::{ClientError, HealthProbe};
use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, Statement};

/// `SELECT 1` against the application database
pub struct DatabaseProbe {
    db: DatabaseConnection,
}

impl DatabaseProbe {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl HealthProbe for DatabaseProbe {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> Result<(), ClientError> {
        let backend = self.db.get_database_backend();
        self.db
            .execute_raw(Statement::from_string(backend, "SELECT 1"))
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

fn classify(err: DbErr) -> ClientError {
    match err {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => ClientError::connection(err.to_string()),
        other => ClientError::rejected(other.to_string()),
    }
}

//! Datastore and app-state adapters.
//!
//! Both run their tools inside the stack's own services through the
//! control plane, so the host needs no database client installed.

use std::future::Future;

use deckhand_control::{ControlResult, ServiceControlPlane};
use deckhand_core::{DeckhandConfig, ServiceRole};

/// The relational datastore, seen as a whole database.
pub trait Datastore: Send + Sync {
    /// Logical dump that drops and recreates objects when replayed.
    fn dump(&self) -> impl Future<Output = ControlResult<Vec<u8>>> + Send;

    /// Replay a dump into the (freshly created) database.
    fn restore(&self, dump: Vec<u8>) -> impl Future<Output = ControlResult<()>> + Send;

    fn drop_database(&self) -> impl Future<Output = ControlResult<()>> + Send;

    fn create_database(&self) -> impl Future<Output = ControlResult<()>> + Send;

    /// Whether the datastore accepts connections.
    fn ping(&self) -> impl Future<Output = bool> + Send;
}

/// Application-level records, exported by natural key.
pub trait AppStateStore: Send + Sync {
    fn export(&self, exclude: &[String]) -> impl Future<Output = ControlResult<Vec<u8>>> + Send;

    fn import(&self, data: Vec<u8>) -> impl Future<Output = ControlResult<()>> + Send;
}

/// PostgreSQL via its client tools inside the datastore service.
#[derive(Debug)]
pub struct PostgresDatastore<'a, C> {
    plane: &'a C,
    service: String,
    database: String,
    user: String,
}

impl<'a, C: ServiceControlPlane> PostgresDatastore<'a, C> {
    pub fn new(plane: &'a C, service: &str, database: &str, user: &str) -> Self {
        Self {
            plane,
            service: service.to_string(),
            database: database.to_string(),
            user: user.to_string(),
        }
    }

    pub fn from_config(plane: &'a C, config: &DeckhandConfig) -> Self {
        Self::new(
            plane,
            config.services.name(ServiceRole::Database),
            &config.datastore.name,
            &config.datastore.user,
        )
    }

    fn command(&self, program: &str, args: &[&str]) -> Vec<String> {
        let mut cmd = vec![program.to_string(), "-U".to_string(), self.user.clone()];
        cmd.extend(args.iter().map(|a| a.to_string()));
        cmd
    }
}

impl<C: ServiceControlPlane> Datastore for PostgresDatastore<'_, C> {
    async fn dump(&self) -> ControlResult<Vec<u8>> {
        let cmd = self.command("pg_dump", &["--clean", "--if-exists", "--no-owner", &self.database]);
        self.plane.exec(&self.service, &cmd, None).await
    }

    async fn restore(&self, dump: Vec<u8>) -> ControlResult<()> {
        let cmd = self.command("psql", &["-v", "ON_ERROR_STOP=1", "-q", "-d", &self.database]);
        self.plane.exec(&self.service, &cmd, Some(dump)).await.map(drop)
    }

    async fn drop_database(&self) -> ControlResult<()> {
        let cmd = self.command("dropdb", &["--if-exists", &self.database]);
        self.plane.exec(&self.service, &cmd, None).await.map(drop)
    }

    async fn create_database(&self) -> ControlResult<()> {
        let cmd = self.command("createdb", &[&self.database]);
        self.plane.exec(&self.service, &cmd, None).await.map(drop)
    }

    async fn ping(&self) -> bool {
        let cmd = self.command("pg_isready", &["-d", &self.database]);
        self.plane.exec(&self.service, &cmd, None).await.is_ok()
    }
}

/// App-state export and import through the web tier's management commands.
#[derive(Debug)]
pub struct ManagementAppState<'a, C> {
    plane: &'a C,
    service: String,
    export_command: Vec<String>,
    import_command: Vec<String>,
}

impl<'a, C: ServiceControlPlane> ManagementAppState<'a, C> {
    pub fn new(plane: &'a C, service: &str, export_command: Vec<String>, import_command: Vec<String>) -> Self {
        Self {
            plane,
            service: service.to_string(),
            export_command,
            import_command,
        }
    }

    pub fn from_config(plane: &'a C, config: &DeckhandConfig) -> Self {
        Self::new(
            plane,
            config.services.name(ServiceRole::Web),
            config.commands.app_state_export.clone(),
            config.commands.app_state_import.clone(),
        )
    }
}

impl<C: ServiceControlPlane> AppStateStore for ManagementAppState<'_, C> {
    async fn export(&self, exclude: &[String]) -> ControlResult<Vec<u8>> {
        let mut cmd = self.export_command.clone();
        for category in exclude {
            cmd.push("--exclude".to_string());
            cmd.push(category.clone());
        }
        self.plane.exec(&self.service, &cmd, None).await
    }

    async fn import(&self, data: Vec<u8>) -> ControlResult<()> {
        self.plane
            .exec(&self.service, &self.import_command, Some(data))
            .await
            .map(drop)
    }
}

//! Command line entry point of the standalone agent.

use crate::api::{AppState, build_router};
use crate::client::ClientError;
use crate::config::AgentConfig;
use clap::Parser;
use forest_core::schema::SchemaError;
use forest_core::{Datasource, DatasourceError, MemoryDatasource, RedbDatasource, Schema};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "forest-agent", version, about = "Admin panel agent")]
pub struct Cli {
    #[command(flatten)]
    pub agent: AgentConfig,

    /// Address the agent listens on.
    #[arg(long, env = "FOREST_AGENT_BIND", default_value = "127.0.0.1:3310")]
    pub bind: SocketAddr,

    /// Path of the `.forestadmin-schema.json` file.
    #[arg(long, env = "FOREST_SCHEMA_PATH", default_value = ".forestadmin-schema.json")]
    pub schema: PathBuf,

    /// redb database file. Records live in memory when omitted.
    #[arg(long, env = "FOREST_DATABASE_PATH")]
    pub database: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("cannot load schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("cannot open datasource: {0}")]
    Datasource(#[from] DatasourceError),

    #[error("cannot build authorization client: {0}")]
    Client(#[from] ClientError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Load the schema and open the datasource named on the command line.
pub fn build_state(cli: &Cli) -> Result<AppState, StartupError> {
    let schema = Schema::from_file(&cli.schema)?;
    let datasource: Arc<dyn Datasource> = match &cli.database {
        Some(path) => Arc::new(RedbDatasource::open(path)?),
        None => {
            tracing::warn!("no database given, records are kept in memory");
            Arc::new(MemoryDatasource::new())
        }
    };
    tracing::info!(
        collections = schema.collections.len(),
        server_url = %cli.agent.server_url,
        "agent configured"
    );
    Ok(AppState::new(cli.agent.clone(), schema, datasource)?)
}

/// Serve the agent until `shutdown` resolves.
pub async fn serve<F>(cli: Cli, shutdown: F) -> Result<(), StartupError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(build_state(&cli)?);
    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    tracing::info!(addr = %cli.bind, "forest agent listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("forest agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const SCHEMA: &str = r#"{
        "collections": [
            {"name": "Question", "fields": [{"field": "question_text", "type": "String"}]}
        ],
        "meta": {"liana": "forest-rust"}
    }"#;

    fn parse(extra: &[&str]) -> Cli {
        let mut args = vec!["forest-agent", "--env-secret", "env", "--auth-secret", "auth"];
        args.extend_from_slice(extra);
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn defaults_apply() {
        let cli = parse(&[]);
        assert_eq!(cli.bind, "127.0.0.1:3310".parse().unwrap());
        assert_eq!(cli.agent.permissions_ttl_secs, 3600);
        assert!(cli.database.is_none());
    }

    #[test]
    fn secrets_are_required() {
        // only fails when the variables are not set in the environment
        if std::env::var_os("FOREST_ENV_SECRET").is_none() {
            assert!(Cli::try_parse_from(["forest-agent", "--auth-secret", "auth"]).is_err());
        }
    }

    #[test]
    fn state_opens_redb_database() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = dir.path().join("schema.json");
        std::fs::write(&schema_path, SCHEMA).unwrap();
        let db_path = dir.path().join("agent.redb");

        let cli = parse(&[
            "--schema",
            schema_path.to_str().unwrap(),
            "--database",
            db_path.to_str().unwrap(),
        ]);
        let state = build_state(&cli).unwrap();
        assert!(state.schema.collection("Question").is_some());
        assert!(db_path.exists());
    }

    #[test]
    fn missing_schema_is_reported() {
        let cli = parse(&["--schema", "/nonexistent/schema.json"]);
        assert!(matches!(build_state(&cli), Err(StartupError::Schema(_))));
    }
}

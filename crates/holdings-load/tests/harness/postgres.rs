//! PostgreSQL testcontainer for end-to-end loads

use anyhow::{Context, Result};
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use tokio::time::sleep;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info};

/// Running PostgreSQL container
pub struct PostgresTestContainer {
    #[allow(dead_code)]
    container: ContainerAsync<Postgres>,
    pub host: String,
    pub port: u16,
}

#[allow(dead_code)]
impl PostgresTestContainer {
    /// Start a container and wait until it accepts connections
    pub async fn start() -> Result<Self> {
        info!("starting PostgreSQL testcontainer");

        let container = Postgres::default()
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(5432).await?;

        let instance = Self {
            container,
            host,
            port,
        };
        instance.wait_for_ready().await?;
        info!(host = %instance.host, port = instance.port, "PostgreSQL container ready");
        Ok(instance)
    }

    /// Connection URL for the default database
    pub fn url(&self) -> String {
        format!(
            "postgres://postgres:postgres@{}:{}/postgres",
            self.host, self.port
        )
    }

    async fn wait_for_ready(&self) -> Result<()> {
        for attempt in 1..=60 {
            match tokio_postgres::connect(&self.url(), NoTls).await {
                Ok(_) => {
                    debug!("PostgreSQL ready after {} attempts", attempt);
                    return Ok(());
                }
                Err(e) if attempt == 60 => {
                    return Err(e).context("PostgreSQL never became ready");
                }
                Err(_) => sleep(Duration::from_millis(500)).await,
            }
        }
        unreachable!()
    }

    /// Plain client for assertions
    pub async fn client(&self) -> Result<Client> {
        let (client, connection) = tokio_postgres::connect(&self.url(), NoTls)
            .await
            .context("Failed to connect to PostgreSQL")?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("test connection error: {}", e);
            }
        });
        Ok(client)
    }
}

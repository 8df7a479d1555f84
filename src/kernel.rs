//! Process supervisor.
//!
//! Starts the selected components as tasks of one runtime: the broker first (bound before any
//! client connects), then the interpreter and the trajectory bridge as broker clients.

use std::path::PathBuf;

use tokio::io::BufReader;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerHandle};
use crate::catalog::ObjectCatalog;
use crate::config::{BrokerAddr, KernelConfig};
use crate::dialogue::DialogueEngine;
use crate::error::KernelError;
use crate::frame::EndpointName;
use crate::link::ClientLink;
use crate::store::CatalogStore;
use crate::trajectory::TrajectoryBridge;

/// Which components to run in this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Components {
    pub broker: bool,
    pub interpreter: bool,
    pub trajectory: bool,
}

impl Components {
    pub fn any(&self) -> bool {
        self.broker || self.interpreter || self.trajectory
    }
}

#[derive(Debug)]
pub struct Kernel {
    config: KernelConfig,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Imports the catalog, falling back to the store when no source file is configured.
    ///
    /// A configured store is refreshed with every fresh import.
    pub async fn load_catalog(&self) -> Result<(ObjectCatalog, Option<CatalogStore>), KernelError> {
        let store = match &self.config.catalog.store_path {
            Some(path) => Some(CatalogStore::open(path)?),
            None => None,
        };

        let catalog = match (&self.config.catalog.path, &store) {
            (Some(path), store) => {
                let catalog = ObjectCatalog::load(path).await?;
                if let Some(store) = store {
                    store.save_all(&catalog)?;
                }
                catalog
            }
            (None, Some(store)) if !store.is_empty() => {
                let catalog = store.load()?;
                info!(objects = catalog.len(), "catalog restored from store");
                catalog
            }
            _ => return Err(KernelError::NoCatalog),
        };
        Ok((catalog, store))
    }

    /// Builds the interpreter. Import failures are fatal.
    pub async fn interpreter(&self) -> Result<DialogueEngine, KernelError> {
        let (catalog, store) = self.load_catalog().await?;
        let engine = DialogueEngine::new(catalog, self.config.dialogue.clone());
        Ok(match store {
            Some(store) => engine.with_store(store),
            None => engine,
        })
    }

    pub async fn start_broker(&self) -> Result<BrokerHandle, KernelError> {
        let broker = Broker::bind(
            self.config.broker.clone(),
            self.config.endpoints.registry(),
        )
        .await?;
        Ok(broker.spawn())
    }

    /// Runs the selected components until Ctrl-C or until all of them have stopped.
    pub async fn run(self, components: Components) -> Result<(), KernelError> {
        info!("Kernel running");
        let mut address: BrokerAddr = self.config.broker.address.clone();
        let mut tasks: JoinSet<(&'static str, Result<(), KernelError>)> = JoinSet::new();
        let mut broker = None;

        if components.broker {
            let handle = self.start_broker().await?;
            address = handle.address().clone();
            broker = Some(handle);
        }

        if components.interpreter {
            let engine = self.interpreter().await?;
            let link = ClientLink::connect(
                &address,
                EndpointName::interpreter(),
                self.config.dialogue.link_capacity,
            )
            .await?;
            tasks.spawn(async move { ("interpreter", engine.run(link).await.map_err(Into::into)) });
        }

        if components.trajectory {
            let mut link = ClientLink::connect(
                &address,
                EndpointName::trajectory_source(),
                self.config.dialogue.link_capacity,
            )
            .await?;
            let feed = self.config.trajectory.feed.clone();
            tasks.spawn(async move { ("trajectory", run_bridge(feed, &mut link).await) });
        }

        if tasks.is_empty() {
            // Broker only.
            tokio::signal::ctrl_c().await?;
        } else {
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupted");
                        break;
                    }
                    joined = tasks.join_next() => match joined {
                        Some(Ok((name, Ok(())))) => info!(component = name, "component stopped"),
                        Some(Ok((name, Err(err)))) => {
                            error!(component = name, error = %err, "component failed")
                        }
                        Some(Err(err)) => error!(error = %err, "component panicked"),
                        None if broker.is_some() => {
                            tokio::signal::ctrl_c().await?;
                            break;
                        }
                        None => break,
                    },
                }
            }
        }

        tasks.abort_all();
        if let Some(handle) = broker {
            handle.shutdown();
        }
        info!("Kernel terminating");
        Ok(())
    }
}

async fn run_bridge(feed: Option<PathBuf>, link: &mut ClientLink) -> Result<(), KernelError> {
    let bridge = TrajectoryBridge::new();
    match feed {
        Some(path) => {
            let file = tokio::fs::File::open(&path).await?;
            bridge.run(BufReader::new(file), link).await?;
        }
        None => {
            warn!("no trajectory feed configured, reading standard input");
            bridge.run(BufReader::new(tokio::io::stdin()), link).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImportError;

    #[tokio::test]
    async fn missing_catalog_is_reported() {
        let kernel = Kernel::new(KernelConfig::default());
        assert!(matches!(
            kernel.load_catalog().await,
            Err(KernelError::NoCatalog)
        ));
    }

    #[tokio::test]
    async fn import_errors_abort_startup() {
        let mut config = KernelConfig::default();
        config.catalog.path = Some(PathBuf::from("/nonexistent/catalog.csv"));
        let kernel = Kernel::new(config);
        assert!(matches!(
            kernel.interpreter().await,
            Err(KernelError::Import(ImportError::Open { .. }))
        ));
    }

    #[tokio::test]
    async fn store_backs_restart_without_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let csv = dir.path().join("blocks.csv");
        tokio::fs::write(&csv, "id;x;y;image;name;color\n7;0.1;0.2;;Brick 2X2;red\n")
            .await
            .expect("fixture");

        let mut config = KernelConfig::default();
        config.catalog.path = Some(csv);
        config.catalog.store_path = Some(dir.path().join("store"));
        {
            let kernel = Kernel::new(config.clone());
            let engine = kernel.interpreter().await.expect("imports");
            assert_eq!(engine.catalog().len(), 1);
        }

        config.catalog.path = None;
        let kernel = Kernel::new(config);
        let (catalog, _) = kernel.load_catalog().await.expect("restores");
        assert_eq!(catalog.get("7").and_then(|r| r.attribute("color")), Some("red"));
    }

    #[test]
    fn no_components_selected() {
        assert!(!Components::default().any());
        assert!(Components {
            trajectory: true,
            ..Components::default()
        }
        .any());
    }
}

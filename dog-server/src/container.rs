//! Static service container.
//!
//! Services are registered once at startup, initialized in registration
//! order, served concurrently and stopped in reverse order.

use anyhow::{bail, Context, Result};
use dog_jobs::{AppContext, Service};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};

#[derive(Default)]
pub struct Container {
    services: Vec<(&'static str, Box<dyn Service>)>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S>(&mut self, id: &'static str, service: S) -> Result<&mut Self>
    where
        S: Service + 'static,
    {
        if self.services.iter().any(|(existing, _)| *existing == id) {
            bail!("service {id} is already registered");
        }
        self.services.push((id, Box::new(service)));
        Ok(self)
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.services.iter().map(|(id, _)| *id).collect()
    }

    /// Init every service, serve until `shutdown` resolves or a service
    /// exits, then stop them all.
    ///
    /// A failed init stops the services already initialized and returns the
    /// error. Stop errors are logged; the first one is returned.
    pub async fn run<F>(self, ctx: &AppContext, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut ready: Vec<(&'static str, Arc<dyn Service>)> =
            Vec::with_capacity(self.services.len());

        for (id, mut service) in self.services {
            info!("Initializing service {}", id);
            if let Err(err) = service.init(ctx).await {
                stop_all(&ready).await.ok();
                return Err(err).with_context(|| format!("initializing service {id}"));
            }
            ready.push((id, Arc::from(service)));
        }

        let mut serving = JoinSet::new();
        for (id, service) in &ready {
            let (id, service) = (*id, service.clone());
            serving.spawn(async move { (id, service.serve().await) });
        }
        info!("Serving {} service(s)", ready.len());

        let mut failure = None;
        tokio::select! {
            _ = shutdown => info!("Shutdown requested"),
            Some(joined) = serving.join_next() => match joined {
                Ok((id, Ok(()))) => info!("Service {} finished", id),
                Ok((id, Err(err))) => {
                    error!("Service {} failed: {}", id, err);
                    failure =
                        Some(anyhow::Error::new(err).context(format!("serving service {id}")));
                }
                Err(err) => {
                    error!("Service task failed: {}", err);
                    failure = Some(anyhow::Error::new(err));
                }
            },
        }

        let stopped = stop_all(&ready).await;

        while let Some(joined) = serving.join_next().await {
            match joined {
                Ok((id, Err(err))) => error!("Service {} exited with error: {}", id, err),
                Err(err) => error!("Service task failed: {}", err),
                Ok(_) => {}
            }
        }

        match failure {
            Some(err) => Err(err),
            None => stopped,
        }
    }
}

async fn stop_all(services: &[(&'static str, Arc<dyn Service>)]) -> Result<()> {
    let mut first = None;
    for (id, service) in services.iter().rev() {
        info!("Stopping service {}", id);
        if let Err(err) = service.stop().await {
            error!("Stopping service {} failed: {}", id, err);
            first.get_or_insert(anyhow::Error::new(err).context(format!("stopping service {id}")));
        }
    }
    first.map_or(Ok(()), Err)
}

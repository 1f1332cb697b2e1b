//! Static driver registration.
//!
//! Drivers are registered by destination-type tag; there is no dynamic
//! loading. The control plane asks the registry for a driver whenever a
//! router claims an upload or the validator probes a destination.

use std::sync::Arc;

use wharf_core::storage::ObjectStore;
use wharf_core::warehouse::{DestinationType, Warehouse};

use crate::datalake::DatalakeDriver;
use crate::driver::{DriverError, ErrorKind, Result, Uploader, WarehouseDriver};
use crate::postgres::PostgresDriver;

/// Resolves a warehouse to its driver implementation.
pub trait DriverRegistry: Send + Sync {
    /// Builds a driver for the warehouse, wired to the given uploader.
    ///
    /// Construction is cheap and does not touch the network; connectivity
    /// errors surface from [`WarehouseDriver::connect`] and later calls.
    ///
    /// # Errors
    ///
    /// Returns a fatal error for unregistered destination types or
    /// incomplete configuration.
    fn driver_for(
        &self,
        warehouse: &Warehouse,
        uploader: Arc<dyn Uploader>,
    ) -> Result<Box<dyn WarehouseDriver>>;
}

/// The built-in registry covering the reference drivers.
pub struct StaticDriverRegistry {
    storage: Arc<dyn ObjectStore>,
}

impl StaticDriverRegistry {
    /// Creates a registry whose drivers pull load files from `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn ObjectStore>) -> Self {
        Self { storage }
    }
}

impl DriverRegistry for StaticDriverRegistry {
    fn driver_for(
        &self,
        warehouse: &Warehouse,
        uploader: Arc<dyn Uploader>,
    ) -> Result<Box<dyn WarehouseDriver>> {
        match warehouse.destination.destination_type {
            DestinationType::Postgres => Ok(Box::new(PostgresDriver::open(
                warehouse,
                uploader,
                Arc::clone(&self.storage),
            )?)),
            DestinationType::S3Datalake => Ok(Box::new(DatalakeDriver::new(
                warehouse,
                uploader,
                Arc::clone(&self.storage),
            ))),
            other => Err(DriverError::new(
                ErrorKind::Fatal,
                format!("no driver registered for destination type {other}"),
            )),
        }
    }
}

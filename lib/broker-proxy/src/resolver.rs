//! Access-token translation for rewriting bindings
//!
//! Clients address vehicles by an opaque access token; some services need
//! the real vehicle id (VIN). A [`KeyResolver`] performs that lookup before
//! a message is dispatched to such a service.

use broker_core::{CoreError, Result};
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Translates an opaque token into a business key
pub trait KeyResolver: Send {
    fn resolve(&self, token: &str) -> Result<String>;
}

/// One registered vehicle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VehicleRecord {
    pub vin: String,
    /// Opaque token handed to the client
    pub uid: String,
    /// Account token supplied at registration
    pub account_token: String,
}

/// In-memory directory of registered vehicles, indexed both ways
#[derive(Debug, Default)]
pub struct VehicleDirectory {
    by_uid: BTreeMap<String, VehicleRecord>,
    uid_by_vin: BTreeMap<String, String>,
}

impl VehicleDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a vehicle. A known VIN keeps its uid and only updates the
    /// account token. Returns the record and whether it was created.
    pub fn register(&mut self, vin: &str, account_token: &str) -> Result<(&VehicleRecord, bool)> {
        if vin.is_empty() {
            return Err(CoreError::InvalidArgument("empty vin".to_string()));
        }

        let (uid, created) = match self.uid_by_vin.get(vin) {
            Some(uid) => (uid.clone(), false),
            None => {
                let uid = Uuid::new_v4().simple().to_string();
                info!("Registered vehicle {} as {}", vin, uid);
                self.uid_by_vin.insert(vin.to_string(), uid.clone());
                (uid, true)
            }
        };

        let record = self
            .by_uid
            .entry(uid.clone())
            .or_insert_with(|| VehicleRecord {
                vin: vin.to_string(),
                uid,
                account_token: String::new(),
            });
        record.account_token = account_token.to_string();
        Ok((&*record, created))
    }

    pub fn find_by_uid(&self, uid: &str) -> Option<&VehicleRecord> {
        self.by_uid.get(uid)
    }

    pub fn find_by_vin(&self, vin: &str) -> Option<&VehicleRecord> {
        self.uid_by_vin.get(vin).and_then(|uid| self.by_uid.get(uid))
    }

    pub fn remove_by_uid(&mut self, uid: &str) -> Result<VehicleRecord> {
        let record = self
            .by_uid
            .remove(uid)
            .ok_or_else(|| CoreError::NotFound(format!("vehicle uid {}", uid)))?;
        self.uid_by_vin.remove(&record.vin);
        debug!("Removed vehicle {}", record.vin);
        Ok(record)
    }

    pub fn remove_by_vin(&mut self, vin: &str) -> Result<VehicleRecord> {
        let uid = self
            .uid_by_vin
            .get(vin)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("vehicle {}", vin)))?;
        self.remove_by_uid(&uid)
    }

    pub fn clear(&mut self) {
        self.by_uid.clear();
        self.uid_by_vin.clear();
    }

    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }
}

impl KeyResolver for VehicleDirectory {
    fn resolve(&self, token: &str) -> Result<String> {
        if token.is_empty() {
            return Err(CoreError::InvalidArgument("empty access token".to_string()));
        }
        self.find_by_uid(token)
            .map(|record| record.vin.clone())
            .ok_or_else(|| CoreError::NotFound(format!("access token {}", token)))
    }
}

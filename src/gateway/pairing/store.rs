//! File-backed device pairing tables
//!
//! `pending.json` maps request id to [`PairingRequest`]; `paired.json` maps
//! device id to [`PairedDevice`]. Every operation is a read-modify-write
//! under one async mutex, and writes replace the files atomically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::gateway::protocol::{
    ApprovedDevice, ClientInfo, DeviceParams, DevicePairingList, PairedDevice, PairingRequest, Role,
};
use crate::persist::{read_json_or_default, write_json_atomic};

/// Pending requests expire this long after creation
pub const PAIRING_REQUEST_TTL_MS: i64 = 120_000;

const PENDING_FILE: &str = "pending.json";
const PAIRED_FILE: &str = "paired.json";

/// Input for a new pairing request
#[derive(Debug, Clone)]
pub struct NewPairingRequest {
    /// Device id
    pub device_id: String,
    /// Device public key
    pub public_key: String,
    /// Requested role
    pub role: Role,
    /// Device was paired before and now fails verification
    pub is_repair: bool,
    /// Client id from `connect`
    pub client_id: Option<String>,
    /// Client platform from `connect`
    pub platform: Option<String>,
    /// Peer IP
    pub remote_ip: Option<String>,
}

/// Result of checking a device against the paired table
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceVerdict {
    /// Paired with a matching key and sufficient role
    Paired(PairedDevice),
    /// Never paired
    Unknown,
    /// Paired, but key or role no longer matches
    Mismatch(PairedDevice),
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn is_expired(request: &PairingRequest, now_ms: i64) -> bool {
    now_ms - request.ts > PAIRING_REQUEST_TTL_MS
}

/// Pending and paired device tables
#[derive(Debug)]
pub struct PairingStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl PairingStore {
    /// Open (lazily) the tables under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        PairingStore {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    /// Directory holding the tables
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn pending_path(&self) -> PathBuf {
        self.dir.join(PENDING_FILE)
    }

    fn paired_path(&self) -> PathBuf {
        self.dir.join(PAIRED_FILE)
    }

    async fn load_pending(&self, now_ms: i64) -> (HashMap<String, PairingRequest>, bool) {
        let mut pending: HashMap<String, PairingRequest> =
            read_json_or_default(&self.pending_path()).await;
        let before = pending.len();
        pending.retain(|_, r| !is_expired(r, now_ms));
        let pruned = pending.len() != before;
        (pending, pruned)
    }

    async fn load_paired(&self) -> HashMap<String, PairedDevice> {
        read_json_or_default(&self.paired_path()).await
    }

    /// Queue a pairing request, reusing an unexpired one for the same device and role
    ///
    /// Returns the request and whether it was newly created.
    pub async fn request_pairing(&self, new: NewPairingRequest) -> Result<(PairingRequest, bool)> {
        let _guard = self.lock.lock().await;
        let now = now_ms();
        let (mut pending, _) = self.load_pending(now).await;

        let existing = pending
            .values()
            .find(|r| r.device_id == new.device_id && r.role == new.role)
            .cloned();
        if let Some(existing) = existing {
            if existing.public_key == new.public_key && existing.is_repair == new.is_repair {
                return Ok((existing, false));
            }
            // Different key or repair status: the old request is superseded, never edited
            pending.remove(&existing.request_id);
            tracing::info!(
                request_id = %existing.request_id,
                device_id = %existing.device_id,
                "pending pairing request superseded"
            );
        }

        let request = PairingRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            device_id: new.device_id,
            public_key: new.public_key,
            role: new.role,
            is_repair: new.is_repair,
            ts: now,
            client_id: new.client_id,
            platform: new.platform,
            remote_ip: new.remote_ip,
        };
        pending.insert(request.request_id.clone(), request.clone());
        write_json_atomic(&self.pending_path(), &pending).await?;

        tracing::info!(
            request_id = %request.request_id,
            device_id = %request.device_id,
            role = %request.role,
            is_repair = request.is_repair,
            "device pairing requested"
        );
        Ok((request, true))
    }

    /// Unexpired pending requests (newest first) and paired devices
    pub async fn list(&self) -> Result<DevicePairingList> {
        let _guard = self.lock.lock().await;
        let (pending, pruned) = self.load_pending(now_ms()).await;
        if pruned {
            write_json_atomic(&self.pending_path(), &pending).await?;
        }

        let mut pending: Vec<PairingRequest> = pending.into_values().collect();
        pending.sort_by(|a, b| b.ts.cmp(&a.ts));

        let mut paired: Vec<PairedDevice> = self.load_paired().await.into_values().collect();
        paired.sort_by(|a, b| b.approved_at.cmp(&a.approved_at));

        Ok(DevicePairingList { pending, paired })
    }

    /// Approve a pending request, replacing any prior record for the device
    pub async fn approve(&self, request_id: &str, note: Option<String>) -> Result<ApprovedDevice> {
        let _guard = self.lock.lock().await;
        let (mut pending, _) = self.load_pending(now_ms()).await;
        let request = pending
            .remove(request_id)
            .ok_or_else(|| Error::NotFound(format!("pairing request {}", request_id)))?;

        let mut paired = self.load_paired().await;
        let device = PairedDevice {
            device_id: request.device_id.clone(),
            public_key: request.public_key,
            role: request.role,
            approved_at: now_ms(),
            note,
            client_id: request.client_id,
            platform: request.platform,
        };
        paired.insert(device.device_id.clone(), device.clone());

        // Paired first: a crash in between leaves a re-approvable request, not a lost one
        write_json_atomic(&self.paired_path(), &paired).await?;
        write_json_atomic(&self.pending_path(), &pending).await?;

        tracing::info!(request_id = %request_id, device_id = %device.device_id, role = %device.role, "device pairing approved");
        Ok(ApprovedDevice {
            request_id: request_id.to_string(),
            device,
        })
    }

    /// Drop a pending request without pairing
    pub async fn reject(&self, request_id: &str) -> Result<PairingRequest> {
        let _guard = self.lock.lock().await;
        let (mut pending, _) = self.load_pending(now_ms()).await;
        let request = pending
            .remove(request_id)
            .ok_or_else(|| Error::NotFound(format!("pairing request {}", request_id)))?;
        write_json_atomic(&self.pending_path(), &pending).await?;

        tracing::info!(request_id = %request_id, device_id = %request.device_id, "device pairing rejected");
        Ok(request)
    }

    /// Forget a paired device
    pub async fn remove_paired(&self, device_id: &str) -> Result<PairedDevice> {
        let _guard = self.lock.lock().await;
        let mut paired = self.load_paired().await;
        let device = paired
            .remove(device_id)
            .ok_or_else(|| Error::NotFound(format!("paired device {}", device_id)))?;
        write_json_atomic(&self.paired_path(), &paired).await?;

        tracing::info!(device_id = %device_id, "paired device removed");
        Ok(device)
    }

    /// Check a device identity against the paired table
    pub async fn verify(&self, device_id: &str, public_key: &str, role: Role) -> DeviceVerdict {
        let _guard = self.lock.lock().await;
        match self.load_paired().await.remove(device_id) {
            None => DeviceVerdict::Unknown,
            Some(device) if device.public_key == public_key && device.role.allows(role) => {
                DeviceVerdict::Paired(device)
            }
            Some(device) => DeviceVerdict::Mismatch(device),
        }
    }

    /// Admit a connecting device or queue a pairing request for it
    ///
    /// Unknown devices get a first-time request; devices whose key or role no
    /// longer matches their paired record get a repair request. Both fail
    /// with [`Error::PairingRequired`].
    pub async fn authorize_device(
        &self,
        device: &DeviceParams,
        role: Role,
        client: &ClientInfo,
        remote_ip: Option<String>,
    ) -> Result<PairedDevice> {
        let is_repair = match self.verify(&device.id, &device.public_key, role).await {
            DeviceVerdict::Paired(paired) => return Ok(paired),
            DeviceVerdict::Unknown => false,
            DeviceVerdict::Mismatch(_) => true,
        };

        let (request, _) = self
            .request_pairing(NewPairingRequest {
                device_id: device.id.clone(),
                public_key: device.public_key.clone(),
                role,
                is_repair,
                client_id: Some(client.id.clone()).filter(|s| !s.is_empty()),
                platform: Some(client.platform.clone()).filter(|s| !s.is_empty()),
                remote_ip,
            })
            .await?;

        Err(Error::PairingRequired(format!(
            "device {} awaiting approval (request {})",
            device.id, request.request_id
        )))
    }
}

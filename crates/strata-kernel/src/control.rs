//! Mount control channel.
//!
//! The external remounter drives the mount table through serialized
//! commands. [`MountController`] executes them synchronously against the
//! core; [`spawn_control_channel`] puts it behind a tokio task so async hosts
//! talk to it through a cloneable [`ControlHandle`].
//!
//! ```text
//!   ControlHandle (Clone)    mpsc     control task          spawn_blocking
//!   ┌──────────────────┐  ───────▶  ┌───────────────┐  ───────▶  MountController
//!   │ .send(cmd)       │            │ one command   │            (sync core)
//!   │                  │  ◀───────  │ at a time     │
//!   └──────────────────┘  oneshot   └───────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::vfs::{
    BackendRegistry, ErrorKind, FsError, FsResult, Inode, InodeSnapshot, MountId, MountInfo,
    MountTable, Router, StorageParams, SubcontainerDescriptor,
};

/// One mount to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountRequest {
    /// Logical paths; the first is the main path.
    pub paths: Vec<String>,
    /// Parameters the backend is built from.
    pub storage_params: StorageParams,
    #[serde(default)]
    pub read_only: bool,
    /// Replace whatever is mounted at the main path.
    #[serde(default)]
    pub remount: bool,
}

impl From<SubcontainerDescriptor> for MountRequest {
    fn from(child: SubcontainerDescriptor) -> Self {
        Self {
            paths: child
                .paths
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            storage_params: child.storage_params,
            read_only: child.read_only,
            remount: false,
        }
    }
}

/// A command on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlCommand {
    Mount { requests: Vec<MountRequest> },
    Unmount { ident: MountId },
    /// Path → idents mapping.
    Paths,
    /// Every mount record.
    Mounts,
    /// Inode table dump.
    Inodes,
    /// Sub-containers exposed by a mount.
    Children { ident: MountId },
}

/// Error as reported over the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: kind.as_ref().to_string(),
            message: message.into(),
        }
    }
}

impl From<&FsError> for ErrorReport {
    fn from(e: &FsError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

/// Result of one mount request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountOutcome {
    Ok(MountId),
    Error(ErrorReport),
}

/// Reply to a [`ControlCommand`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlResponse {
    Mounted { results: Vec<MountOutcome> },
    Unmounted { ident: MountId },
    Paths(BTreeMap<String, Vec<MountId>>),
    Mounts(Vec<MountInfo>),
    Inodes(BTreeMap<Inode, InodeSnapshot>),
    Children(Vec<SubcontainerDescriptor>),
    Error(ErrorReport),
}

impl From<FsError> for ControlResponse {
    fn from(e: FsError) -> Self {
        ControlResponse::Error(ErrorReport::from(&e))
    }
}

/// Parse one JSON command. Parse failures come back as `InvalidArgument`.
pub fn parse_command(json: &str) -> Result<ControlCommand, ErrorReport> {
    serde_json::from_str(json).map_err(|e| {
        ErrorReport::new(ErrorKind::InvalidArgument, format!("malformed command: {e}"))
    })
}

/// Executes control commands against the core.
pub struct MountController {
    registry: BackendRegistry,
    router: Arc<Router>,
}

impl std::fmt::Debug for MountController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountController")
            .field("registry", &self.registry)
            .field("router", &self.router)
            .finish()
    }
}

impl MountController {
    pub fn new(registry: BackendRegistry, router: Arc<Router>) -> Self {
        Self { registry, router }
    }

    pub fn table(&self) -> &Arc<MountTable> {
        self.router.table()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Build the backend for one request and mount it.
    pub fn mount(&self, request: &MountRequest) -> FsResult<MountId> {
        let backend = self
            .registry
            .build(&request.storage_params, request.read_only)?;
        let paths = request.paths.iter().map(PathBuf::from).collect();
        self.table().mount(paths, backend, request.remount)
    }

    /// Mount each request independently; one failure does not stop the rest.
    pub fn mount_all(&self, requests: &[MountRequest]) -> Vec<MountOutcome> {
        requests
            .iter()
            .map(|request| match self.mount(request) {
                Ok(ident) => MountOutcome::Ok(ident),
                Err(e) => {
                    warn!(
                        paths = ?request.paths,
                        backend = %request.storage_params.backend_type,
                        error = %e,
                        "mount request failed"
                    );
                    MountOutcome::Error(ErrorReport::from(&e))
                }
            })
            .collect()
    }

    pub fn unmount(&self, ident: MountId) -> FsResult<()> {
        self.table().unmount(ident)
    }

    /// Execute one command. Errors become [`ControlResponse::Error`].
    pub fn handle(&self, command: ControlCommand) -> ControlResponse {
        match command {
            ControlCommand::Mount { requests } => ControlResponse::Mounted {
                results: self.mount_all(&requests),
            },
            ControlCommand::Unmount { ident } => match self.unmount(ident) {
                Ok(()) => ControlResponse::Unmounted { ident },
                Err(e) => {
                    warn!(%ident, error = %e, "unmount request failed");
                    e.into()
                }
            },
            ControlCommand::Paths => ControlResponse::Paths(self.table().paths()),
            ControlCommand::Mounts => ControlResponse::Mounts(self.table().list_mounts()),
            ControlCommand::Inodes => ControlResponse::Inodes(self.router.inodes().snapshot()),
            ControlCommand::Children { ident } => match self.table().children(ident) {
                Ok(children) => ControlResponse::Children(children),
                Err(e) => e.into(),
            },
        }
    }
}

/// Errors from the control channel itself.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control channel shut down")]
    Shutdown,
}

struct Envelope {
    command: ControlCommand,
    reply: oneshot::Sender<ControlResponse>,
}

/// Cloneable sender side of the control channel.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<Envelope>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope").field("command", &self.command).finish()
    }
}

impl ControlHandle {
    /// Submit a command and wait for its reply.
    pub async fn send(&self, command: ControlCommand) -> Result<ControlResponse, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { command, reply })
            .await
            .map_err(|_| ControlError::Shutdown)?;
        rx.await.map_err(|_| ControlError::Shutdown)
    }

    /// Mount a batch of requests.
    pub async fn mount(
        &self,
        requests: Vec<MountRequest>,
    ) -> Result<ControlResponse, ControlError> {
        self.send(ControlCommand::Mount { requests }).await
    }

    /// Unmount one ident.
    pub async fn unmount(&self, ident: MountId) -> Result<ControlResponse, ControlError> {
        self.send(ControlCommand::Unmount { ident }).await
    }
}

/// Run the controller behind an mpsc channel.
///
/// Commands execute one at a time on the blocking pool. The task ends once
/// every [`ControlHandle`] is dropped.
pub fn spawn_control_channel(
    controller: Arc<MountController>,
    capacity: usize,
) -> (ControlHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Envelope>(capacity.max(1));
    let task = tokio::spawn(async move {
        while let Some(Envelope { command, reply }) = rx.recv().await {
            let controller = controller.clone();
            let response =
                match tokio::task::spawn_blocking(move || controller.handle(command)).await {
                    Ok(response) => response,
                    Err(e) => {
                        error!(error = %e, "control command panicked");
                        ControlResponse::Error(ErrorReport::new(
                            ErrorKind::IoFailure,
                            format!("control command failed: {e}"),
                        ))
                    }
                };
            // The caller may have given up waiting.
            let _ = reply.send(response);
        }
        info!("control channel closed");
    });
    (ControlHandle { tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn controller() -> Arc<MountController> {
        let router = Arc::new(Router::new(Arc::new(MountTable::new())));
        Arc::new(MountController::new(BackendRegistry::with_builtin(), router))
    }

    fn memory_request(path: &str) -> MountRequest {
        MountRequest {
            paths: vec![path.to_string()],
            storage_params: StorageParams::new("memory"),
            read_only: false,
            remount: false,
        }
    }

    #[test]
    fn test_parse_commands() {
        let cmd = parse_command(
            r#"{"cmd":"mount","requests":[{"paths":["/c1"],"storage_params":{"type":"local","path":"/srv"},"read_only":true}]}"#,
        )
        .unwrap();
        let ControlCommand::Mount { requests } = cmd else {
            panic!("expected mount");
        };
        assert!(requests[0].read_only);
        assert!(!requests[0].remount);
        assert_eq!(requests[0].storage_params.str_param("path").unwrap(), "/srv");

        assert_eq!(
            parse_command(r#"{"cmd":"unmount","ident":3}"#).unwrap(),
            ControlCommand::Unmount { ident: MountId(3) }
        );
        assert_eq!(parse_command(r#"{"cmd":"paths"}"#).unwrap(), ControlCommand::Paths);

        let err = parse_command(r#"{"cmd":"format_disk"}"#).unwrap_err();
        assert_eq!(err.kind, "InvalidArgument");
    }

    #[test]
    fn test_mount_all_reports_each_request() {
        let controller = controller();
        let mut bad = memory_request("/b");
        bad.storage_params = StorageParams::new("imap");
        let results = controller.mount_all(&[memory_request("/a"), bad, memory_request("/a")]);

        assert_eq!(results[0], MountOutcome::Ok(MountId(1)));
        assert!(matches!(&results[1], MountOutcome::Error(e) if e.kind == "NotSupported"));
        assert!(matches!(&results[2], MountOutcome::Error(e) if e.kind == "AlreadyMounted"));
        assert_eq!(controller.table().len(), 1);
    }

    #[test]
    fn test_read_only_flag_reaches_backend() {
        let controller = controller();
        let mut request = memory_request("/ro");
        request.read_only = true;
        let ident = controller.mount(&request).unwrap();
        assert!(controller.table().lookup_by_ident(ident).unwrap().read_only);
    }

    #[test]
    fn test_children_of_read_only_mount_remount_read_only() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("album")).unwrap();
        let controller = controller();
        let parent = MountRequest {
            paths: vec!["/photos".to_string()],
            storage_params: StorageParams::new("local")
                .with_param("path", dir.path().to_string_lossy().into_owned())
                .with_param("split_children", true),
            read_only: true,
            remount: false,
        };
        let ident = controller.mount(&parent).unwrap();

        let children = controller.table().children(ident).unwrap();
        assert_eq!(children.len(), 1);
        let request = MountRequest::from(children[0].clone());
        assert_eq!(request.paths, vec!["/photos/album"]);
        assert!(request.read_only);

        let child = controller.mount(&request).unwrap();
        assert!(controller.table().lookup_by_ident(child).unwrap().read_only);
    }

    #[test]
    fn test_response_wire_format() {
        let controller = controller();
        let response = controller.handle(ControlCommand::Mount {
            requests: vec![memory_request("/c1")],
        });
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"mounted": {"results": [{"ok": 1}]}})
        );

        let response = controller.handle(ControlCommand::Paths);
        assert_eq!(serde_json::to_value(&response).unwrap(), json!({"paths": {"/c1": [1]}}));

        let response = controller.handle(ControlCommand::Unmount { ident: MountId(42) });
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"]["kind"], "NotFound");
    }

    #[tokio::test]
    async fn test_channel_round_trip() {
        let (handle, task) = spawn_control_channel(controller(), 8);

        let response = handle.mount(vec![memory_request("/c1")]).await.unwrap();
        assert_eq!(
            response,
            ControlResponse::Mounted {
                results: vec![MountOutcome::Ok(MountId(1))]
            }
        );

        let response = handle.send(ControlCommand::Mounts).await.unwrap();
        let ControlResponse::Mounts(mounts) = response else {
            panic!("expected mounts");
        };
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].paths, vec!["/c1".to_string()]);

        assert_eq!(
            handle.unmount(MountId(1)).await.unwrap(),
            ControlResponse::Unmounted { ident: MountId(1) }
        );

        // Unknown ident is reported, not fatal.
        let response = handle.unmount(MountId(1)).await.unwrap();
        assert!(matches!(response, ControlResponse::Error(ref e) if e.kind == "NotFound"));
        let response = handle.send(ControlCommand::Paths).await.unwrap();
        assert_eq!(response, ControlResponse::Paths(BTreeMap::new()));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_channel_reports_shutdown() {
        let (handle, task) = spawn_control_channel(controller(), 1);
        task.abort();
        let _ = task.await;
        let err = handle.send(ControlCommand::Paths).await.unwrap_err();
        assert!(matches!(err, ControlError::Shutdown));
    }
}

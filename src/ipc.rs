//! Control-plane messages
//!
//! Management tools send [`IpcRequest`]s over a local socket; the daemon turns
//! each one into a [`QueueTask`] tagged with the descriptor the reply goes
//! back on. The socket protocol itself lives outside this crate.

use crate::config::NodeRecord;
use crate::login::LoginStatus;
use crate::session::SessionId;

/// Descriptor of the management connection a reply is owed to
pub type IpcFd = i32;

#[derive(Debug, Clone)]
pub enum IpcRequest {
    Login { rec: NodeRecord },
    Logout { session: SessionId },
}

impl IpcRequest {
    pub fn into_task(self, ipc_fd: IpcFd) -> QueueTask {
        match self {
            IpcRequest::Login { rec } => QueueTask::Login { rec, ipc_fd },
            IpcRequest::Logout { session } => QueueTask::Logout { session, ipc_fd },
        }
    }
}

/// Events raised by the control plane rather than by a management request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEventKind {
    DropConnection { cid: u16 },
    DropSession,
}

/// Unit of work consumed by the daemon core
#[derive(Debug, Clone)]
pub enum QueueTask {
    Login { rec: NodeRecord, ipc_fd: IpcFd },
    Logout { session: SessionId, ipc_fd: IpcFd },
    AsyncEvent { session: SessionId, event: AsyncEventKind },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcResponse {
    LoggedIn {
        session: SessionId,
        tsih: u16,
    },
    LoginFailed {
        session: SessionId,
        status: LoginStatus,
        status_class: u8,
        status_detail: u8,
    },
    LoggedOut {
        session: SessionId,
    },
    Error {
        message: String,
    },
}

impl IpcResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, IpcResponse::LoginFailed { .. } | IpcResponse::Error { .. })
    }
}

/// A response addressed to the descriptor that asked for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcReply {
    pub ipc_fd: IpcFd,
    pub response: IpcResponse,
}

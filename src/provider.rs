//! Data-path provider registry
//!
//! Each provider is a way of moving full-feature traffic (software TCP, iSER,
//! offload hardware). The table is filled once at startup and then only read
//! when a session is created or torn down.

use crate::error::{IscsiError, IscsiResult};
use crate::session::SessionId;

/// Data-path kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProviderType {
    #[default]
    SoftTcp,
    SoftIser,
    Iser,
    AccelIscsi,
}

impl ProviderType {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderType::SoftTcp => "tcp",
            ProviderType::SoftIser => "iser-sw",
            ProviderType::Iser => "iser",
            ProviderType::AccelIscsi => "accel-iscsi",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(ProviderType::SoftTcp),
            "iser-sw" => Some(ProviderType::SoftIser),
            "iser" => Some(ProviderType::Iser),
            "accel-iscsi" => Some(ProviderType::AccelIscsi),
            _ => None,
        }
    }

    /// The negotiated result is pushed down to an offloaded data path
    pub fn kernel_io(&self) -> bool {
        !matches!(self, ProviderType::SoftTcp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderStatus {
    #[default]
    Unknown,
    Operational,
    Failed,
}

/// A data-path provider and the sessions bound to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub kind: ProviderType,
    pub status: ProviderStatus,
    pub sessions: Vec<SessionId>,
}

impl Provider {
    pub fn is_operational(&self) -> bool {
        self.status == ProviderStatus::Operational
    }
}

/// Process-wide provider registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderTable {
    providers: Vec<Provider>,
}

impl ProviderTable {
    /// Register every known provider. Only software TCP is usable out of the box.
    pub fn init() -> Self {
        let providers = [
            ProviderType::SoftTcp,
            ProviderType::SoftIser,
            ProviderType::Iser,
            ProviderType::AccelIscsi,
        ]
        .into_iter()
        .map(|kind| Provider {
            kind,
            status: if kind == ProviderType::SoftTcp {
                ProviderStatus::Operational
            } else {
                ProviderStatus::Unknown
            },
            sessions: Vec::new(),
        })
        .collect();

        ProviderTable { providers }
    }

    pub fn lookup(&self, kind: ProviderType) -> Option<&Provider> {
        self.providers.iter().find(|p| p.kind == kind)
    }

    fn lookup_mut(&mut self, kind: ProviderType) -> IscsiResult<&mut Provider> {
        self.providers
            .iter_mut()
            .find(|p| p.kind == kind)
            .ok_or_else(|| IscsiError::Session(format!("provider {} not registered", kind.name())))
    }

    pub fn set_status(&mut self, kind: ProviderType, status: ProviderStatus) -> IscsiResult<()> {
        let provider = self.lookup_mut(kind)?;
        log::info!("provider {}: {:?} -> {:?}", kind.name(), provider.status, status);
        provider.status = status;
        Ok(())
    }

    /// Attach a session; fails unless the provider is operational
    pub fn bind(&mut self, kind: ProviderType, session: SessionId) -> IscsiResult<()> {
        let provider = self.lookup_mut(kind)?;
        if !provider.is_operational() {
            return Err(IscsiError::Session(format!(
                "provider {} is not operational ({:?})",
                kind.name(),
                provider.status
            )));
        }
        if !provider.sessions.contains(&session) {
            provider.sessions.push(session);
        }
        Ok(())
    }

    pub fn unbind(&mut self, kind: ProviderType, session: SessionId) {
        if let Ok(provider) = self.lookup_mut(kind) {
            provider.sessions.retain(|s| *s != session);
        }
    }
}

impl Default for ProviderTable {
    fn default() -> Self {
        ProviderTable::init()
    }
}

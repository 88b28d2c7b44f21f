//! A pure Rust iSCSI initiator login engine
//!
//! This library implements the initiator side of RFC 3720 login: the login
//! phase state machine, the per-connection login state machine and the
//! session model that ties connections together. Sockets, authentication and
//! scheduling sit behind small traits so the same code runs against a live
//! target or a scripted one.
//!
//! # Example
//!
//! ```no_run
//! use iscsi_initiator::{LoginStatus, NodeRecord, ProviderTable, Session, SessionId, TcpTransport};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rec = NodeRecord::builder()
//!     .initiator_name("iqn.2025-12.local:initiator")
//!     .target_name("iqn.2025-12.local:storage.disk1")
//!     .portal("192.168.1.10:3260")
//!     .build()?;
//!
//! let mut providers = ProviderTable::init();
//! let mut session = Session::create(SessionId(1), rec, &mut providers)?;
//! session.cnx_create(0, Box::new(TcpTransport::new()))?;
//!
//! if session.login(0)? == LoginStatus::Ok {
//!     println!("logged in, TSIH {}", session.tsih);
//!     session.logout(std::time::Duration::from_secs(15))?;
//! }
//! session.destroy(&mut providers);
//! # Ok(())
//! # }
//! ```
//!
//! A daemon drives many sessions without blocking through [`Initiator`],
//! feeding it [`QueueTask`]s and calling [`Initiator::run_once`].

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod initiator;
pub mod ipc;
pub mod login;
pub mod mainloop;
pub mod params;
pub mod pdu;
pub mod provider;
pub mod session;
pub mod transport;

pub use auth::{AuthClient, AuthConfig, ChapCredentials};
pub use config::NodeRecord;
pub use connection::{CnxLoginStatus, Connection, LoginOutcome, Timeouts};
pub use error::{IscsiError, IscsiResult};
pub use initiator::Initiator;
pub use ipc::{IpcRequest, IpcResponse, QueueTask};
pub use login::{LoginContext, LoginStatus};
pub use provider::{ProviderTable, ProviderType};
pub use session::{Session, SessionId, SessionParams, SessionType};
pub use transport::{Portal, TcpTransport, Transport};

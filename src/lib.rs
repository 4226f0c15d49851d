//! Client-side XMPP wire protocol core.
//!
//! This crate owns everything between a TCP socket and a stream of parsed
//! stanzas: endpoint resolution (SRV or explicit host), the RFC 6120
//! negotiation ladder (STARTTLS, zlib compression, SASL, resource binding,
//! legacy session), and long-running connection supervision with backoff,
//! keepalive pings and entity-capability announcements. What it does *not*
//! do is interpret stanzas: messages, presence and IQs are handed to the
//! host application verbatim through [`ConnectionEvents`].
//!
//! The usual entry point is the [`Scheduler`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use jabwire::{Account, ConnectionEvents, Scheduler, SchedulerConfig, Stanza};
//!
//! struct Printer;
//!
//! impl ConnectionEvents for Printer {
//!     fn on_stanza(&self, stanza: Stanza) {
//!         println!("{} via {:?}", stanza.name(), stanza.via());
//!     }
//! }
//!
//! # async fn run() {
//! let scheduler = Scheduler::new(SchedulerConfig::default(), Arc::new(Printer), None);
//! scheduler.set_accounts(vec![Account::new("romeo@example.com", "secret", "mobile")]);
//! scheduler.run().await;
//! # }
//! ```
//!
//! A single supervised connection without the scheduler is available
//! through [`Connection::open`].

pub mod account;
pub mod caps;
pub mod codec;
pub mod connection;
pub mod dns;
pub mod error;
pub mod jid;
pub mod negotiate;
pub mod sasl;
pub mod scheduler;
pub mod stanza;
pub mod supervisor;
pub mod transport;

pub use account::{Account, ConnectConfig};
pub use caps::{CapabilityQuery, DiscoInfo, Identity};
pub use connection::Connection;
pub use error::{ErrorKind, Result, XmppError};
pub use scheduler::{AccountStatus, Scheduler, SchedulerConfig};
pub use stanza::{Attribute, Stanza};
pub use supervisor::{ConnectionEvents, State};
pub use transport::tls::TlsPolicy;

//! Ephemeral Docker infrastructure for integration tests.
//!
//! A [`Session`](session::Session) provisions containers, networks, volumes,
//! data containers, swarm clusters, services and stacks, remembers every
//! resource it created, and tears them down again at the end of its scope,
//! tolerating resources that already disappeared.
//!
//! ```rust,no_run
//! use container_fixtures::config::Settings;
//! use container_fixtures::engine::connect_engine;
//! use container_fixtures::provision::{NetworkDriver, VolumeKind};
//! use container_fixtures::session::{ContainerRequest, Scope, Session, SessionContext};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let context = SessionContext::new(Settings::resolve()?)?;
//! let engine = connect_engine().await?;
//! let session = Session::new(Scope::Class, engine, context);
//!
//! session
//!     .scoped(async |s| {
//!         let image = s.image().await?;
//!         let request = ContainerRequest::new(image)
//!             .network(NetworkDriver::Overlay)
//!             .volumes(VolumeKind::Named);
//!         let fixture = s.provision_container(&request).await?;
//!         assert_eq!(fixture.container.status.as_deref(), Some("running"));
//!         Ok(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod cli;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod naming;
pub mod provision;
pub mod session;
pub mod stack;
pub mod testing;

pub use client::DockerClient;
pub use error::{FixtureError, Result};
pub use session::{Scope, Session, SessionContext};

//! swarmgate - A self-coordinating HTTPS gateway for Docker Swarm
//!
//! Multiple instances run behind one address and coordinate through etcd:
//! - Leader election decides which node writes shared state
//! - Labeled swarm services become virtual hosts with automatic certificates
//! - ACME HTTP-01 challenges are answered by every node from the store
//! - TLS termination with per-SNI certificate selection and Basic Auth

pub mod acme;
pub mod auth;
pub mod certificate;
pub mod docker;
pub mod election;
pub mod http;
pub mod https;
pub mod store;
pub mod vhost;

pub use acme::{AcmeConfig, AcmeManager, CertLifecycle, ChallengeRecord};
pub use auth::{AuthDecision, AuthGate};
pub use certificate::CertificateCache;
pub use docker::{ServiceReconciler, ServiceSource, ServiceSummary, SwarmClient};
pub use election::{LeaderElection, Role};
pub use http::HttpServer;
pub use https::HttpsServer;
pub use store::{Store, StoreError, StoreRead, StoreWrite};
pub use vhost::{AuthPolicy, RoutingOptions, VhostRegistry, VirtualHost};

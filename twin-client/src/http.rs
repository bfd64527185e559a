//! Shared HTTPS connector construction.
//!
//! One connector recipe for every outbound call in the workspace: the twin
//! client itself and the LLM selector adapters both build on this.

use std::sync::Arc;

use hyper::client::HttpConnector;
use hyper::{Body, Client};
use hyper_rustls::HttpsConnector;
use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore};
use webpki_roots::TLS_SERVER_ROOTS;

/// Hyper client type used for all outbound HTTP in the workspace.
pub type HyperClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Builds a client trusting the webpki root set, accepting both `http` and
/// `https` URIs (plant-floor AAS repositories frequently run plain HTTP on
/// an isolated network).
#[must_use]
pub fn build_client() -> HyperClient {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|anchor| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let mut http = HttpConnector::new();
    http.enforce_http(false);

    let connector = HttpsConnector::from((http, Arc::new(config)));
    Client::builder().build::<_, Body>(connector)
}

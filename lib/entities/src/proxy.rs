use serde::{Deserialize, Serialize};

use crate::app::AppIdentifier;

/// A derived reverse-proxy route (spec §3, §4.J). One route per exposed
/// app; absent when `is_exposed=false` or the app directory is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRoute {
  pub route_id: String,
  pub hosts: Vec<String>,
  pub upstream: String,
}

impl ProxyRoute {
  pub fn route_id_for(app_id: &AppIdentifier) -> String {
    format!("route-for-{app_id}")
  }

  pub fn upstream_for(host_port: u32) -> String {
    format!("localhost:{host_port}")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn route_id_format() {
    assert_eq!(
      ProxyRoute::route_id_for(&AppIdentifier::derive("myapp")),
      "route-for-myapp"
    );
  }
}

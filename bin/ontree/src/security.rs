//! Compose security validator (spec §4.C). Rejects unsafe Compose
//! content: privileged mode, dangerous capabilities, bind mounts
//! outside the allowed roots. Deterministic: same bytes, same verdict.

use ontree_entities::{AppPaths, EngineError};
use serde_yaml_ng::Value;

const BLOCKED_CAPS: &[&str] = &[
  "SYS_ADMIN",
  "NET_ADMIN",
  "SYS_MODULE",
  "SYS_RAWIO",
  "SYS_PTRACE",
  "SYS_BOOT",
  "MAC_ADMIN",
  "MAC_OVERRIDE",
  "DAC_READ_SEARCH",
  "SETFCAP",
];

/// Validates a parsed Compose document's `services` against the
/// policy. `bypass_security=true` in `x-ontree` (already an
/// administrator-only, out-of-band flag — spec §4.C, §9) skips all
/// rules. `demo_mode` additionally restricts bind mounts to relative
/// paths only.
pub fn validate(
  parsed: &Value,
  paths: &AppPaths,
  shared_root: &std::path::Path,
  bypass_security: bool,
  demo_mode: bool,
) -> Result<(), EngineError> {
  if bypass_security {
    return Ok(());
  }
  let Some(Value::Mapping(services)) = parsed.get("services") else {
    return Ok(());
  };
  for (name, svc) in services.iter() {
    let name = name.as_str().unwrap_or("<unknown>").to_string();
    check_privileged(&name, svc)?;
    check_cap_add(&name, svc)?;
    check_bind_mounts(&name, svc, paths, shared_root, demo_mode)?;
  }
  Ok(())
}

fn check_privileged(service: &str, svc: &Value) -> Result<(), EngineError> {
  let privileged = matches!(svc.get("privileged"), Some(Value::Bool(true)));
  if privileged {
    return Err(violation(service, "privileged mode", "services.*.privileged must be false or absent"));
  }
  Ok(())
}

fn check_cap_add(service: &str, svc: &Value) -> Result<(), EngineError> {
  let Some(Value::Sequence(caps)) = svc.get("cap_add") else {
    return Ok(());
  };
  for cap in caps {
    let Some(cap) = cap.as_str() else { continue };
    let normalized = cap.trim_start_matches("CAP_").trim_start_matches("cap_").to_uppercase();
    if BLOCKED_CAPS.contains(&normalized.as_str()) {
      return Err(violation(
        service,
        "disallowed capability",
        &format!("cap_add must not contain {cap} (blocked: {})", BLOCKED_CAPS.join(", ")),
      ));
    }
  }
  Ok(())
}

fn check_bind_mounts(
  service: &str,
  svc: &Value,
  paths: &AppPaths,
  shared_root: &std::path::Path,
  demo_mode: bool,
) -> Result<(), EngineError> {
  let Some(Value::Sequence(volumes)) = svc.get("volumes") else {
    return Ok(());
  };
  for vol in volumes {
    let host_path = match vol {
      Value::String(short) => {
        // short form: "host:container[:mode]"; only a host path starting
        // with '/' or '.' is a bind mount — bare names are named volumes.
        let first = short.split(':').next().unwrap_or("");
        if first.starts_with('/') || first.starts_with('.') {
          Some(first.to_string())
        } else {
          None
        }
      }
      Value::Mapping(_) => {
        let is_bind = vol.get("type").and_then(Value::as_str) == Some("bind");
        if is_bind {
          vol.get("source").and_then(Value::as_str).map(str::to_string)
        } else {
          None
        }
      }
      _ => None,
    };
    let Some(host_path) = host_path else { continue };
    check_bind_mount_path(service, &host_path, paths, shared_root, demo_mode)?;
  }
  Ok(())
}

fn check_bind_mount_path(
  service: &str,
  host_path: &str,
  paths: &AppPaths,
  shared_root: &std::path::Path,
  demo_mode: bool,
) -> Result<(), EngineError> {
  if demo_mode && !host_path.starts_with('.') {
    return Err(violation(
      service,
      "bind mount path",
      "in demo mode only relative bind mount paths are permitted",
    ));
  }
  // Dot-prefixed paths are relative to the app directory (where the
  // compose file lives) and still must land inside an allowed root —
  // `.`/`..` are a traversal vector, not an exemption (spec §4.C rule 3).
  let resolved = if host_path.starts_with('.') {
    resolve_relative(&paths.app_dir, host_path)
  } else {
    std::path::PathBuf::from(host_path)
  };
  let allowed_roots = [&paths.volumes_root, &paths.mnt_root, &shared_root.to_path_buf()];
  let allowed = allowed_roots.iter().any(|root| path_is_within(&resolved, root));
  if !allowed {
    return Err(violation(
      service,
      "bind mount path",
      &format!(
        "host path {host_path} must lie within one of: {}, {}, {}",
        paths.volumes_root.display(),
        paths.mnt_root.display(),
        shared_root.display()
      ),
    ));
  }
  Ok(())
}

/// Lexically resolves `rel` (which may contain `.`/`..` components)
/// against `base`, without touching the filesystem — the bind mount's
/// target need not exist yet at validation time.
fn resolve_relative(base: &std::path::Path, rel: &str) -> std::path::PathBuf {
  use std::path::Component;
  let mut stack: Vec<Component> = base.components().collect();
  for component in std::path::Path::new(rel).components() {
    match component {
      Component::ParentDir => {
        stack.pop();
      }
      Component::CurDir => {}
      other => stack.push(other),
    }
  }
  stack.into_iter().collect()
}

fn path_is_within(host_path: &std::path::Path, root: &std::path::Path) -> bool {
  host_path.starts_with(root)
}

fn violation(service: &str, rule: &str, detail: &str) -> EngineError {
  EngineError::SecurityViolation {
    service: service.to_string(),
    rule: rule.to_string(),
    detail: detail.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;

  fn paths() -> AppPaths {
    AppPaths::new(&PathBuf::from("/apps"), "myapp")
  }

  #[test]
  fn rejects_privileged() {
    let parsed: Value = serde_yaml_ng::from_str("services:\n  web:\n    privileged: true\n").unwrap();
    let err = validate(&parsed, &paths(), std::path::Path::new("/shared"), false, false).unwrap_err();
    assert_eq!(err.code(), "security_violation");
  }

  #[test]
  fn rejects_blocked_capability_case_insensitively() {
    let parsed: Value = serde_yaml_ng::from_str("services:\n  web:\n    cap_add:\n      - CAP_SYS_ADMIN\n").unwrap();
    assert!(validate(&parsed, &paths(), std::path::Path::new("/shared"), false, false).is_err());
  }

  #[test]
  fn allows_capability_not_in_blocklist() {
    let parsed: Value = serde_yaml_ng::from_str("services:\n  web:\n    cap_add:\n      - CHOWN\n").unwrap();
    assert!(validate(&parsed, &paths(), std::path::Path::new("/shared"), false, false).is_ok());
  }

  #[test]
  fn rejects_bind_mount_outside_allowed_roots() {
    let parsed: Value = serde_yaml_ng::from_str("services:\n  web:\n    volumes:\n      - /etc/passwd:/etc/passwd:ro\n").unwrap();
    let err = validate(&parsed, &paths(), std::path::Path::new("/shared"), false, false).unwrap_err();
    match err {
      EngineError::SecurityViolation { rule, .. } => assert_eq!(rule, "bind mount path"),
      _ => panic!("expected security violation"),
    }
  }

  #[test]
  fn allows_bind_mount_inside_volumes_root() {
    let p = paths();
    let vol = format!("{}:/data\n", p.volumes_root.join("x").display());
    let parsed: Value = serde_yaml_ng::from_str(&format!("services:\n  web:\n    volumes:\n      - {vol}")).unwrap();
    assert!(validate(&parsed, &p, std::path::Path::new("/shared"), false, false).is_ok());
  }

  #[test]
  fn rejects_dot_prefixed_traversal_outside_allowed_roots() {
    let parsed: Value =
      serde_yaml_ng::from_str("services:\n  web:\n    volumes:\n      - ../../../etc/passwd:/etc/passwd:ro\n").unwrap();
    let err = validate(&parsed, &paths(), std::path::Path::new("/shared"), false, false).unwrap_err();
    match err {
      EngineError::SecurityViolation { rule, .. } => assert_eq!(rule, "bind mount path"),
      _ => panic!("expected security violation"),
    }
  }

  #[test]
  fn rejects_dot_prefixed_traversal_in_demo_mode_too() {
    let parsed: Value =
      serde_yaml_ng::from_str("services:\n  web:\n    volumes:\n      - ../../../etc/passwd:/etc/passwd:ro\n").unwrap();
    assert!(validate(&parsed, &paths(), std::path::Path::new("/shared"), false, true).is_err());
  }

  #[test]
  fn allows_relative_bind_mount_that_resolves_inside_volumes_root() {
    let p = paths();
    let parsed: Value = serde_yaml_ng::from_str("services:\n  web:\n    volumes:\n      - ./volumes/x:/data\n").unwrap();
    assert!(validate(&parsed, &p, std::path::Path::new("/shared"), false, false).is_ok());
  }

  #[test]
  fn named_volume_is_unrestricted() {
    let parsed: Value = serde_yaml_ng::from_str("services:\n  web:\n    volumes:\n      - dbdata:/var/lib/data\n").unwrap();
    assert!(validate(&parsed, &paths(), std::path::Path::new("/shared"), false, false).is_ok());
  }

  #[test]
  fn bypass_security_skips_all_rules() {
    let parsed: Value = serde_yaml_ng::from_str("services:\n  web:\n    privileged: true\n").unwrap();
    assert!(validate(&parsed, &paths(), std::path::Path::new("/shared"), true, false).is_ok());
  }

  #[test]
  fn validation_is_deterministic() {
    let parsed: Value = serde_yaml_ng::from_str("services:\n  web:\n    privileged: true\n").unwrap();
    let a = validate(&parsed, &paths(), std::path::Path::new("/shared"), false, false);
    let b = validate(&parsed, &paths(), std::path::Path::new("/shared"), false, false);
    assert_eq!(a.is_err(), b.is_err());
  }
}

//! Compose metadata store (spec §4.B).
//!
//! Reads and writes the Compose YAML while preserving comments, map key
//! ordering, and unknown top-level fields. No crate in reach round-trips
//! YAML without losing comments, so the mutation surface named by the
//! spec — the `x-ontree` sub-document and, for image updates, only
//! `services.<name>.image` — is patched surgically against the raw text
//! instead of through a full parse/serialize cycle.

use std::path::Path;

use ontree_entities::{EngineError, OnTreeMetadata};
use serde_yaml_ng::Value;

/// A Compose file kept in both its original text (`raw`, what gets
/// patched and written back) and parsed form (`parsed`, used for reads:
/// metadata lookup, service enumeration, port extraction).
#[derive(Debug, Clone)]
pub struct ComposeDocument {
  pub raw: String,
  pub parsed: Value,
}

impl ComposeDocument {
  pub fn read(path: &Path) -> Result<Self, EngineError> {
    let raw = std::fs::read_to_string(path)
      .map_err(|_| EngineError::ComposeMissing(path.display().to_string()))?;
    Self::parse(raw)
  }

  pub fn parse(raw: String) -> Result<Self, EngineError> {
    let parsed: Value = serde_yaml_ng::from_str(&raw)
      .map_err(|e| EngineError::ComposeParseFailed(e.to_string()))?;
    Ok(Self { raw, parsed })
  }

  /// Atomic write: temp file in the same directory, then rename.
  /// Concurrent writers to the same app must be serialised by the
  /// caller's per-app file lock (spec §4.B); this function does not
  /// lock by itself.
  pub fn write(&self, path: &Path) -> Result<(), EngineError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
      .map_err(|e| EngineError::ComposeError(format!("tmp file: {e}")))?;
    use std::io::Write;
    tmp
      .write_all(self.raw.as_bytes())
      .map_err(|e| EngineError::ComposeError(format!("write: {e}")))?;
    tmp
      .persist(path)
      .map_err(|e| EngineError::ComposeError(format!("rename: {e}")))?;
    Ok(())
  }

  pub fn get_metadata(&self) -> Option<OnTreeMetadata> {
    let ext = self.parsed.get("x-ontree")?;
    serde_yaml_ng::from_value(ext.clone()).ok()
  }

  /// Patches `x-ontree` in both the parsed value and the raw text.
  /// `setMetadata(doc, getMetadata(doc))` is a no-op by construction:
  /// the rendered block is deterministic for a given `meta`.
  pub fn set_metadata(&mut self, meta: &OnTreeMetadata) -> Result<(), EngineError> {
    let value = serde_yaml_ng::to_value(meta)
      .map_err(|e| EngineError::ComposeError(format!("serialize metadata: {e}")))?;
    if let Value::Mapping(map) = &mut self.parsed {
      map.insert(Value::String("x-ontree".to_string()), value);
    }
    let block = render_x_ontree_block(meta);
    self.raw = patch_top_level_block(&self.raw, "x-ontree", &block, "services");
    Ok(())
  }

  /// Patches `services.<name>.image` only, leaving everything else —
  /// including the rest of that service's block — untouched.
  pub fn set_image_tag(&mut self, service: &str, new_image: &str) -> Result<(), EngineError> {
    let new_raw = patch_service_image(&self.raw, service, new_image).ok_or_else(|| {
      EngineError::ComposeError(format!("no image: line found for service {service}"))
    })?;
    self.raw = new_raw;
    self.parsed = serde_yaml_ng::from_str(&self.raw)
      .map_err(|e| EngineError::ComposeParseFailed(e.to_string()))?;
    Ok(())
  }

  pub fn services(&self) -> Vec<String> {
    let Some(Value::Mapping(services)) = self.parsed.get("services") else {
      return Vec::new();
    };
    services
      .keys()
      .filter_map(|k| k.as_str().map(str::to_string))
      .collect()
  }

  pub fn service_images(&self) -> Vec<(String, String)> {
    let Some(Value::Mapping(services)) = self.parsed.get("services") else {
      return Vec::new();
    };
    services
      .iter()
      .filter_map(|(name, svc)| {
        let name = name.as_str()?.to_string();
        let image = svc.get("image")?.as_str()?.to_string();
        Some((name, image))
      })
      .collect()
  }

  /// First host port encountered in any service's `ports:` list (spec
  /// §4.G install). Supports short form (`"8080:80"`, `8080`) and
  /// long form (`{published: 8080, target: 80}`).
  pub fn first_host_port(&self) -> Option<u32> {
    let Value::Mapping(services) = &self.parsed.get("services")? else {
      return None;
    };
    for (_, svc) in services.iter() {
      let Some(Value::Sequence(ports)) = svc.get("ports") else {
        continue;
      };
      for port in ports {
        if let Some(p) = parse_port_entry(port) {
          return Some(p);
        }
      }
    }
    None
  }

  pub fn references_shared_inference_root(&self) -> bool {
    self.raw.contains("/ollama") || self.raw.contains("ontree.inference")
  }
}

fn parse_port_entry(port: &Value) -> Option<u32> {
  match port {
    Value::String(s) => {
      let host_part = s.split(':').next()?;
      host_part.trim().parse().ok()
    }
    Value::Number(n) => n.as_u64().map(|v| v as u32),
    Value::Mapping(_) => port.get("published").and_then(|v| match v {
      Value::Number(n) => n.as_u64().map(|v| v as u32),
      Value::String(s) => s.parse().ok(),
      _ => None,
    }),
    _ => None,
  }
}

fn render_x_ontree_block(meta: &OnTreeMetadata) -> String {
  format!(
    "x-ontree:\n  subdomain: {:?}\n  host_port: {}\n  is_exposed: {}\n  emoji: {:?}\n  bypass_security: {}\n",
    meta.subdomain, meta.host_port, meta.is_exposed, meta.emoji, meta.bypass_security
  )
}

/// Replaces the top-level `key:` block (the key line plus every
/// following line that is blank or indented) with `block`. If the key
/// is absent, inserts `block` immediately before `insert_before_key`'s
/// top-level line, or appends it if that key is also absent.
fn patch_top_level_block(raw: &str, key: &str, block: &str, insert_before_key: &str) -> String {
  let lines: Vec<&str> = raw.split('\n').collect();
  let key_line = format!("{key}:");
  let block_lines: Vec<String> = block.trim_end_matches('\n').split('\n').map(str::to_string).collect();

  if let Some(start) = lines.iter().position(|l| l.trim_end() == key_line) {
    let mut end = start + 1;
    while end < lines.len() {
      let l = lines[end];
      if l.is_empty() || l.starts_with(' ') || l.starts_with('\t') {
        end += 1;
      } else {
        break;
      }
    }
    let mut out: Vec<String> = lines[..start].iter().map(|s| s.to_string()).collect();
    out.extend(block_lines);
    out.extend(lines[end..].iter().map(|s| s.to_string()));
    return out.join("\n");
  }

  let insert_key_line = format!("{insert_before_key}:");
  if let Some(pos) = lines.iter().position(|l| l.trim_end() == insert_key_line) {
    let mut out: Vec<String> = lines[..pos].iter().map(|s| s.to_string()).collect();
    out.extend(block_lines);
    out.push(String::new());
    out.extend(lines[pos..].iter().map(|s| s.to_string()));
    return out.join("\n");
  }

  let mut out: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
  if out.last().is_some_and(|s| !s.is_empty()) {
    out.push(String::new());
  }
  out.extend(block_lines);
  out.join("\n")
}

/// Finds `services.<service>.image:` and replaces only the value,
/// keeping indentation and any trailing ` #comment`.
fn patch_service_image(raw: &str, service: &str, new_image: &str) -> Option<String> {
  let lines: Vec<&str> = raw.split('\n').collect();
  let services_start = lines.iter().position(|l| l.trim_end() == "services:")?;

  let mut idx = services_start + 1;
  let mut service_line_idx = None;
  let mut service_indent = 0;
  while idx < lines.len() {
    let l = lines[idx];
    if !(l.is_empty() || l.starts_with(' ') || l.starts_with('\t')) {
      break;
    }
    let trimmed = l.trim_start();
    if trimmed == format!("{service}:") {
      service_line_idx = Some(idx);
      service_indent = l.len() - trimmed.len();
      break;
    }
    idx += 1;
  }
  let service_line_idx = service_line_idx?;

  let mut end = service_line_idx + 1;
  while end < lines.len() {
    let l = lines[end];
    if l.trim().is_empty() {
      end += 1;
      continue;
    }
    let trimmed = l.trim_start();
    let indent = l.len() - trimmed.len();
    if indent <= service_indent {
      break;
    }
    end += 1;
  }

  for i in (service_line_idx + 1)..end {
    let l = lines[i];
    let trimmed = l.trim_start();
    if let Some(rest) = trimmed.strip_prefix("image:") {
      let indent_str = &l[..l.len() - trimmed.len()];
      let rest = rest.trim_start();
      let comment = rest.find(" #").map(|p| rest[p..].to_string()).unwrap_or_default();
      let mut out: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
      out[i] = format!("{indent_str}image: {new_image}{comment}");
      return Some(out.join("\n"));
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = "services:\n  web:\n    image: nginx:1.0 # pinned\n    ports:\n      - \"8080:80\"\n";

  #[test]
  fn reads_services_and_first_port() {
    let doc = ComposeDocument::parse(SAMPLE.to_string()).unwrap();
    assert_eq!(doc.services(), vec!["web".to_string()]);
    assert_eq!(doc.first_host_port(), Some(8080));
  }

  #[test]
  fn get_metadata_absent_is_none() {
    let doc = ComposeDocument::parse(SAMPLE.to_string()).unwrap();
    assert!(doc.get_metadata().is_none());
  }

  #[test]
  fn set_metadata_inserts_then_roundtrips() {
    let mut doc = ComposeDocument::parse(SAMPLE.to_string()).unwrap();
    let meta = OnTreeMetadata {
      subdomain: "chat".to_string(),
      host_port: 8080,
      is_exposed: true,
      emoji: "🌳".to_string(),
      bypass_security: false,
    };
    doc.set_metadata(&meta).unwrap();
    let read_back = doc.get_metadata().unwrap();
    assert_eq!(read_back, meta);
    assert!(doc.raw.contains("x-ontree:"));
    assert!(doc.services().contains(&"web".to_string()));
  }

  #[test]
  fn set_metadata_is_noop_when_reapplying_read_value() {
    let mut doc = ComposeDocument::parse(SAMPLE.to_string()).unwrap();
    doc
      .set_metadata(&OnTreeMetadata { subdomain: "a".into(), host_port: 1, is_exposed: true, emoji: String::new(), bypass_security: false })
      .unwrap();
    let after_first = doc.raw.clone();
    let meta = doc.get_metadata().unwrap();
    doc.set_metadata(&meta).unwrap();
    assert_eq!(doc.raw, after_first);
  }

  #[test]
  fn set_image_tag_preserves_comment_and_siblings() {
    let mut doc = ComposeDocument::parse(SAMPLE.to_string()).unwrap();
    doc.set_image_tag("web", "nginx:2.0").unwrap();
    assert!(doc.raw.contains("image: nginx:2.0 # pinned"));
    assert!(doc.raw.contains("8080:80"));
  }

  #[test]
  fn unparsable_yaml_is_compose_parse_failed() {
    let err = ComposeDocument::parse("services: [".to_string()).unwrap_err();
    assert_eq!(err.code(), "compose_parse_failed");
  }
}
